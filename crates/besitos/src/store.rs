//! The persistence boundary: an opaque transactional store.
//!
//! The ledger sees only these traits. [`MemoryStore`] is the reference
//! implementation; `besitos-store-postgres` provides the store-backed one.
//! A transaction stages writes and applies nothing until `commit` —
//! rollback (explicit or by drop) leaves the store byte-for-byte unchanged.

use crate::error::StoreError;
use crate::model::{ActionType, PointsTransaction, UserBalance, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// An open atomic transaction. Consumed by `commit` or `rollback`; dropping
/// it uncommitted is equivalent to rollback.
#[async_trait]
pub trait LedgerTx: Send {
    async fn fetch_balance(&mut self, user_id: UserId) -> Result<Option<UserBalance>, StoreError>;

    async fn insert_transaction(&mut self, record: &PointsTransaction) -> Result<(), StoreError>;

    async fn write_balance(&mut self, balance: &UserBalance) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Transactional store for balances and the transaction log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    /// Read outside any transaction; used for failure results and queries.
    async fn balance(&self, user_id: UserId) -> Result<Option<UserBalance>, StoreError>;

    /// Committed transactions, newest first, filterable by type and time.
    async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
        action_types: Option<&[ActionType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PointsTransaction>, StoreError>;

    /// Full committed history for one user, oldest first. Drives the
    /// integrity fold.
    async fn full_history(&self, user_id: UserId) -> Result<Vec<PointsTransaction>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    balances: HashMap<UserId, UserBalance>,
    log: Vec<PointsTransaction>,
}

/// In-memory reference store. Commit applies staged writes under one lock,
/// so a commit is all-or-nothing.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            staged_balance: None,
            staged_records: Vec::new(),
        }))
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<UserBalance>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.balances.get(&user_id).cloned())
    }

    async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
        action_types: Option<&[ActionType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PointsTransaction>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut rows: Vec<PointsTransaction> = inner
            .log
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| action_types.is_none_or(|ts| ts.contains(&t.action_type)))
            .filter(|t| since.is_none_or(|s| t.created_at >= s))
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    async fn full_history(&self, user_id: UserId) -> Result<Vec<PointsTransaction>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .log
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }
}

struct MemoryTx {
    inner: Arc<Mutex<MemoryInner>>,
    staged_balance: Option<UserBalance>,
    staged_records: Vec<PointsTransaction>,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn fetch_balance(&mut self, user_id: UserId) -> Result<Option<UserBalance>, StoreError> {
        if let Some(staged) = &self.staged_balance {
            if staged.user_id == user_id {
                return Ok(Some(staged.clone()));
            }
        }
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.balances.get(&user_id).cloned())
    }

    async fn insert_transaction(&mut self, record: &PointsTransaction) -> Result<(), StoreError> {
        self.staged_records.push(record.clone());
        Ok(())
    }

    async fn write_balance(&mut self, balance: &UserBalance) -> Result<(), StoreError> {
        self.staged_balance = Some(balance.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.log.extend(self.staged_records);
        if let Some(balance) = self.staged_balance {
            inner.balances.insert(balance.user_id, balance);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Staged writes are dropped with self; nothing reached the store.
        Ok(())
    }
}
