//! Concurrency stress tests: per-user serialization, cross-user
//! parallelism, and invariant preservation under mixed load.

use crate::store::{LedgerStore, LedgerTx};
use crate::{
    AbuseConfig, ActionContext, ActionType, AwardRequest, EventBus, Ledger, LedgerConfig,
    MemoryStore, MultiplierConfig, PointsLedger, PointsTransaction, StoreError, UserBalance,
    UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn permissive_abuse() -> AbuseConfig {
    AbuseConfig {
        ceilings: Default::default(),
        default_ceiling: 100_000,
        duplicate_tolerance: 100_000,
        ..AbuseConfig::default()
    }
}

fn stress_ledger(store: Arc<dyn LedgerStore>) -> Arc<PointsLedger> {
    Arc::new(PointsLedger::with_config(
        store,
        Arc::new(EventBus::default()),
        LedgerConfig {
            retry_backoff: Duration::from_millis(1),
            ..LedgerConfig::default()
        },
        permissive_abuse(),
        MultiplierConfig::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_awards_for_one_user_all_apply() {
    let store = Arc::new(MemoryStore::new());
    let ledger = stress_ledger(store.clone());
    let user = UserId(1);

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..50 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger
                .award_points(AwardRequest::new(1, ActionType::MessageSent).with_points(5))
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().success);
    }

    assert!(
        started.elapsed() < Duration::from_secs(5),
        "50 serialized awards took {:?}",
        started.elapsed()
    );
    assert_eq!(ledger.get_user_balance(user).await.unwrap(), (250, 250));
    assert_eq!(store.full_history(user).await.unwrap().len(), 50);
    assert!(ledger.verify_balance_integrity(user).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_concurrent_load_preserves_invariants() {
    let store = Arc::new(MemoryStore::new());
    let ledger = stress_ledger(store.clone());
    let users: Vec<UserId> = (1..=8).map(UserId).collect();

    let mut tasks = Vec::new();
    for round in 0..20 {
        for user in &users {
            let ledger = ledger.clone();
            let user = *user;
            tasks.push(tokio::spawn(async move {
                if fastrand::bool() {
                    let points = fastrand::i64(1..20);
                    ledger
                        .award_points(
                            AwardRequest::new(user.0, ActionType::MessageSent)
                                .with_points(points)
                                .with_context(
                                    ActionContext::new()
                                        .with_dedupe_key(format!("{user}-{round}")),
                                ),
                        )
                        .await;
                } else {
                    // Spends may legitimately bounce off an empty balance.
                    let amount = fastrand::u64(1..10);
                    let _ = ledger.spend_points(user, amount, "stress", None).await;
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    for user in users {
        assert!(
            ledger.verify_balance_integrity(user).await.unwrap(),
            "integrity broken for {user}"
        );
        let (total, available) = ledger.get_user_balance(user).await.unwrap();
        assert!(available <= total);
    }
}

/// Store wrapper that slows every balance fetch for one chosen user,
/// simulating a user whose operations are expensive.
struct SlowForUser {
    inner: MemoryStore,
    slow_user: UserId,
    delay: Duration,
}

struct SlowTx {
    inner: Box<dyn LedgerTx>,
    slow_user: UserId,
    delay: Duration,
}

#[async_trait]
impl LedgerStore for SlowForUser {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        Ok(Box::new(SlowTx {
            inner: self.inner.begin().await?,
            slow_user: self.slow_user,
            delay: self.delay,
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

#[async_trait]
impl LedgerTx for SlowTx {
    async fn fetch_balance(&mut self, user_id: UserId) -> Result<Option<UserBalance>, StoreError> {
        if user_id == self.slow_user {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.fetch_balance(user_id).await
    }

    async fn insert_transaction(&mut self, record: &PointsTransaction) -> Result<(), StoreError> {
        self.inner.insert_transaction(record).await
    }

    async fn write_balance(&mut self, balance: &UserBalance) -> Result<(), StoreError> {
        self.inner.write_balance(balance).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_user_does_not_delay_other_users() {
    let store = Arc::new(SlowForUser {
        inner: MemoryStore::new(),
        slow_user: UserId(1),
        delay: Duration::from_millis(300),
    });
    let ledger = stress_ledger(store);

    let slow = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .award_points(AwardRequest::new(1, ActionType::MessageSent).with_points(5))
                .await
        })
    };

    // Give the slow operation time to take user 1's lock.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    for i in 0..10 {
        let result = ledger
            .award_points(
                AwardRequest::new(2, ActionType::MessageSent)
                    .with_points(5)
                    .with_context(ActionContext::new().with_dedupe_key(format!("b{i}"))),
            )
            .await;
        assert!(result.success);
    }
    let other_user_elapsed = started.elapsed();

    assert!(
        other_user_elapsed < Duration::from_millis(250),
        "user 2 was delayed by user 1's slow operation: {other_user_elapsed:?}"
    );
    assert!(slow.await.unwrap().success);
}

#[tokio::test]
async fn elapsed_deadline_rolls_back_and_reports_failure() {
    let store = Arc::new(SlowForUser {
        inner: MemoryStore::new(),
        slow_user: UserId(1),
        delay: Duration::from_millis(300),
    });
    let ledger = PointsLedger::with_config(
        store.clone(),
        Arc::new(EventBus::default()),
        LedgerConfig {
            operation_timeout: Some(Duration::from_millis(50)),
            retry_backoff: Duration::from_millis(1),
            ..LedgerConfig::default()
        },
        permissive_abuse(),
        MultiplierConfig::default(),
    );

    let result = ledger
        .award_points(AwardRequest::new(1, ActionType::MessageSent).with_points(5))
        .await;

    assert!(!result.success);
    assert_eq!(
        result.error_message.as_deref(),
        Some("operation deadline elapsed")
    );
    assert_eq!(result.new_balance, (0, 0));
    // Rollback completed before the call returned: nothing persisted.
    assert!(store.full_history(UserId(1)).await.unwrap().is_empty());
    assert!(store.balance(UserId(1)).await.unwrap().is_none());
}
