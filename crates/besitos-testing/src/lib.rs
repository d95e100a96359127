//! Test doubles for the besitos ledger and event bus.
//!
//! - [`ConflictStore`] wraps any [`LedgerStore`] and fails the first N
//!   commits with a transient conflict, for exercising the ledger's retry
//!   path.
//! - [`RecordingHandler`] collects every event it receives and can be told
//!   to fail, for exercising the bus's failure isolation.

use anyhow::Result;
use async_trait::async_trait;
use besitos_core::{
    ActionType, Event, EventHandler, LedgerStore, LedgerTx, PointsTransaction, StoreError,
    UserBalance, UserId,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Store wrapper that injects `StoreError::Conflict` into the first
/// `conflicts` commits, then delegates untouched. Reads and staged writes
/// pass straight through, so a conflicted commit leaves no state behind —
/// exactly like a real serialization failure.
pub struct ConflictStore<S> {
    inner: S,
    conflicts_remaining: Arc<AtomicU32>,
}

impl<S: LedgerStore> ConflictStore<S> {
    pub fn new(inner: S, conflicts: u32) -> Self {
        Self {
            inner,
            conflicts_remaining: Arc::new(AtomicU32::new(conflicts)),
        }
    }

    /// Conflicts not yet consumed.
    pub fn remaining_conflicts(&self) -> u32 {
        self.conflicts_remaining.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: LedgerStore> LedgerStore for ConflictStore<S> {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(ConflictTx {
            inner,
            conflicts_remaining: Arc::clone(&self.conflicts_remaining),
        }))
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<UserBalance>, StoreError> {
        self.inner.balance(user_id).await
    }

    async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
        action_types: Option<&[ActionType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PointsTransaction>, StoreError> {
        self.inner
            .transactions(user_id, limit, action_types, since)
            .await
    }

    async fn full_history(&self, user_id: UserId) -> Result<Vec<PointsTransaction>, StoreError> {
        self.inner.full_history(user_id).await
    }
}

struct ConflictTx {
    inner: Box<dyn LedgerTx>,
    conflicts_remaining: Arc<AtomicU32>,
}

#[async_trait]
impl LedgerTx for ConflictTx {
    async fn fetch_balance(&mut self, user_id: UserId) -> Result<Option<UserBalance>, StoreError> {
        self.inner.fetch_balance(user_id).await
    }

    async fn insert_transaction(&mut self, record: &PointsTransaction) -> Result<(), StoreError> {
        self.inner.insert_transaction(record).await
    }

    async fn write_balance(&mut self, balance: &UserBalance) -> Result<(), StoreError> {
        self.inner.write_balance(balance).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let consumed = self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .is_ok();
        if consumed {
            self.inner.rollback().await?;
            return Err(StoreError::Conflict(
                "injected serialization failure".to_string(),
            ));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

/// Event handler that records everything it sees. `fail_next(n)` makes the
/// next `n` deliveries return an error (the events are still recorded, so
/// tests can assert both delivery and failure accounting).
pub struct RecordingHandler {
    name: String,
    events: Mutex<Vec<Event>>,
    failures_remaining: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
            failures_remaining: AtomicUsize::new(0),
        })
    }

    pub fn fail_next(&self, failures: usize) {
        self.failures_remaining.store(failures, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("recording handler poisoned").clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.event_type.as_str().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("recording handler poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .expect("recording handler poisoned")
            .push(event.clone());
        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .is_ok();
        if fail {
            anyhow::bail!("induced failure in handler `{}`", self.name);
        }
        Ok(())
    }
}
