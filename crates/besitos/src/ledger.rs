//! The points ledger: validation, multiplier application, atomic
//! persistence, and balance exposure.
//!
//! Locking discipline: each public operation acquires the per-user mutex
//! exactly once, at its entry point. Every helper below that line operates
//! on already-fetched, lock-free data — no code path reacquires a user lock
//! it already holds. Distinct users proceed fully in parallel.
//!
//! Transient store conflicts retry the *whole* operation, revalidation
//! included, with the user lock released between attempts.

use crate::antiabuse::AntiAbuseValidator;
use crate::bus::EventDistributor;
use crate::config::{AbuseConfig, LedgerConfig, MultiplierConfig};
use crate::error::{LedgerError, StoreError};
use crate::event::Event;
use crate::model::{
    ActionContext, ActionType, AwardRequest, AwardResult, MultiplierMap, PointsTransaction,
    UserBalance, UserId,
};
use crate::multiplier::MultiplierCalculator;
use crate::store::{LedgerStore, LedgerTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// The ledger capability set: award, spend, query, verify.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Award (or, forced, adjust) points. Never returns `Err`: every failure
    /// mode is reported inside the result with the unchanged balance.
    async fn award_points(&self, request: AwardRequest) -> AwardResult;

    /// Atomically debit spendable points. `Ok(false)` means insufficient
    /// funds and no side effects.
    async fn spend_points(
        &self,
        user_id: UserId,
        amount: u64,
        reason: &str,
        context: Option<ActionContext>,
    ) -> Result<bool, LedgerError>;

    /// `(total_points, available_points)`; `(0, 0)` for unknown users.
    async fn get_user_balance(&self, user_id: UserId) -> Result<(u64, u64), LedgerError>;

    /// Committed transactions, newest first.
    async fn get_transaction_history(
        &self,
        user_id: UserId,
        limit: usize,
        action_types: Option<&[ActionType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PointsTransaction>, LedgerError>;

    /// Refold the full history and compare against the stored projection.
    async fn verify_balance_integrity(&self, user_id: UserId) -> Result<bool, LedgerError>;
}

enum Attempt {
    /// Finished without a commit (rejection or constraint failure).
    Done(AwardResult),
    /// Committed; the event still needs publishing outside the user lock.
    Committed {
        result: AwardResult,
        record: PointsTransaction,
    },
}

enum SpendOutcome {
    Insufficient,
    Spent(PointsTransaction),
}

/// Orchestrates the validator, the multiplier calculator, the store, and
/// the bus. One per process; cheap to share behind an [`Arc`].
pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
    bus: Arc<dyn EventDistributor>,
    validator: AntiAbuseValidator,
    multipliers: MultiplierCalculator,
    config: LedgerConfig,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn LedgerStore>, bus: Arc<dyn EventDistributor>) -> Self {
        Self::with_config(
            store,
            bus,
            LedgerConfig::default(),
            AbuseConfig::default(),
            MultiplierConfig::default(),
        )
    }

    pub fn with_config(
        store: Arc<dyn LedgerStore>,
        bus: Arc<dyn EventDistributor>,
        config: LedgerConfig,
        abuse: AbuseConfig,
        multipliers: MultiplierConfig,
    ) -> Self {
        Self {
            store,
            bus,
            validator: AntiAbuseValidator::new(abuse),
            multipliers: MultiplierCalculator::new(multipliers),
            config,
            user_locks: DashMap::new(),
        }
    }

    /// Per-user serialization primitive. The lock table entry is cloned out
    /// before awaiting so no dashmap shard is held across the await.
    async fn lock_user(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = { self.user_locks.entry(user_id).or_default().clone() };
        lock.lock_owned().await
    }

    async fn balance_snapshot(&self, user_id: UserId) -> Result<(u64, u64), StoreError> {
        Ok(self
            .store
            .balance(user_id)
            .await?
            .map_or((0, 0), |b| (b.total_points, b.available_points)))
    }

    /// One locked attempt at an award. The guard drops when this returns,
    /// so retries reacquire and publication happens lock-free.
    async fn try_award(&self, request: &AwardRequest) -> Result<Attempt, StoreError> {
        let _guard = self.lock_user(request.user_id).await;

        if !request.force {
            if let Err(violation) =
                self.validator
                    .validate_action(request.user_id, request.action_type, &request.context)
            {
                debug!(user = %request.user_id, %violation, "award rejected");
                let balance = self.balance_snapshot(request.user_id).await?;
                return Ok(Attempt::Done(AwardResult::rejected(&violation, balance)));
            }
        }

        let base_points = match self.resolve_base_points(request) {
            Ok(points) => points,
            Err(message) => {
                let balance = self.balance_snapshot(request.user_id).await?;
                return Ok(Attempt::Done(AwardResult::failed(message, balance)));
            }
        };

        let multipliers = self.multipliers.calculate_multipliers(
            request.user_id,
            request.action_type,
            &request.context,
        );
        let points_change = MultiplierCalculator::apply(base_points, &multipliers);
        if points_change <= 0 && !request.action_type.is_adjustment_capable() {
            let balance = self.balance_snapshot(request.user_id).await?;
            return Ok(Attempt::Done(AwardResult::failed(
                format!(
                    "{} resolved to a non-positive amount ({points_change})",
                    request.action_type
                ),
                balance,
            )));
        }

        let mut tx = self.store.begin().await?;
        let staged = match self.config.operation_timeout {
            Some(limit) => {
                match tokio::time::timeout(
                    limit,
                    Self::stage_award(&mut *tx, request, base_points, points_change, &multipliers),
                )
                .await
                {
                    Ok(staged) => staged,
                    Err(_elapsed) => {
                        // Deadline elapsed mid-transaction: roll back before
                        // returning so partial application is never observable.
                        rollback_quietly(tx).await;
                        let balance = self.balance_snapshot(request.user_id).await?;
                        return Ok(Attempt::Done(AwardResult::failed(
                            LedgerError::DeadlineElapsed.to_string(),
                            balance,
                        )));
                    }
                }
            }
            None => {
                Self::stage_award(&mut *tx, request, base_points, points_change, &multipliers)
                    .await
            }
        };

        let (record, next) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                rollback_quietly(tx).await;
                return Err(err);
            }
        };
        tx.commit().await?;

        self.validator.record_action(
            request.user_id,
            request.action_type,
            &request.context,
            points_change,
        );
        debug!(
            user = %request.user_id,
            action = %request.action_type,
            points = points_change,
            balance = next.total_points,
            "award committed"
        );

        let result = AwardResult {
            success: true,
            points_awarded: points_change,
            base_points,
            multipliers_applied: multipliers,
            new_balance: (next.total_points, next.available_points),
            transaction_id: Some(record.id),
            violation: None,
            error_message: None,
        };
        Ok(Attempt::Committed { result, record })
    }

    /// Stage the transaction row and the recomputed balance. Operates only
    /// on data fetched through the open transaction — no user locks here.
    async fn stage_award(
        tx: &mut dyn LedgerTx,
        request: &AwardRequest,
        base_points: i64,
        points_change: i64,
        multipliers: &MultiplierMap,
    ) -> Result<(PointsTransaction, UserBalance), StoreError> {
        let mut next = tx
            .fetch_balance(request.user_id)
            .await?
            .unwrap_or_else(|| UserBalance::new(request.user_id));
        next.apply_award(points_change);

        let record = PointsTransaction {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            action_type: request.action_type,
            points_change,
            balance_after: next.total_points,
            base_points,
            multipliers_applied: multipliers.clone(),
            context: request.context.clone(),
            created_at: Utc::now(),
            validation_passed: !request.force,
        };
        tx.insert_transaction(&record).await?;
        tx.write_balance(&next).await?;
        Ok((record, next))
    }

    async fn try_spend(
        &self,
        user_id: UserId,
        amount: u64,
        reason: &str,
        context: Option<&ActionContext>,
    ) -> Result<SpendOutcome, StoreError> {
        let _guard = self.lock_user(user_id).await;

        let mut tx = self.store.begin().await?;
        let staged = Self::stage_spend(&mut *tx, user_id, amount, reason, context).await;
        match staged {
            Ok(Some(record)) => {
                tx.commit().await?;
                debug!(user = %user_id, amount, "spend committed");
                Ok(SpendOutcome::Spent(record))
            }
            Ok(None) => {
                rollback_quietly(tx).await;
                Ok(SpendOutcome::Insufficient)
            }
            Err(err) => {
                rollback_quietly(tx).await;
                Err(err)
            }
        }
    }

    async fn stage_spend(
        tx: &mut dyn LedgerTx,
        user_id: UserId,
        amount: u64,
        reason: &str,
        context: Option<&ActionContext>,
    ) -> Result<Option<PointsTransaction>, StoreError> {
        let Some(mut next) = tx.fetch_balance(user_id).await? else {
            return Ok(None);
        };
        if !next.apply_spend(amount) {
            return Ok(None);
        }

        let mut spend_context = context.cloned().unwrap_or_default();
        spend_context.note.get_or_insert_with(|| reason.to_string());

        let record = PointsTransaction {
            id: Uuid::new_v4(),
            user_id,
            action_type: ActionType::Spend,
            points_change: -(amount as i64),
            balance_after: next.total_points,
            base_points: -(amount as i64),
            multipliers_applied: MultiplierMap::new(),
            context: spend_context,
            created_at: Utc::now(),
            validation_passed: true,
        };
        tx.insert_transaction(&record).await?;
        tx.write_balance(&next).await?;
        Ok(Some(record))
    }

    fn resolve_base_points(&self, request: &AwardRequest) -> Result<i64, String> {
        let base = request
            .explicit_points
            .or_else(|| self.config.base_points.get(&request.action_type).copied())
            .or_else(|| {
                request
                    .action_type
                    .amount_from_context()
                    .then_some(request.context.amount)
                    .flatten()
            });
        let Some(base) = base else {
            return Err(format!(
                "no point amount configured for {}",
                request.action_type
            ));
        };
        if base <= 0 && !request.action_type.is_adjustment_capable() {
            return Err(format!(
                "{} requires a strictly positive amount, got {base}",
                request.action_type
            ));
        }
        Ok(base)
    }

    /// Publication happens after commit and after the user lock is released;
    /// a slow or failing subscriber can never block a ledger mutation.
    async fn publish_balance_event(&self, action: &str, record: &PointsTransaction) {
        let payload = json!({
            "user_id": record.user_id,
            "action_type": record.action_type,
            "points_change": record.points_change,
            "balance_after": record.balance_after,
            "transaction_id": record.id,
        });
        let event = match Event::new(&format!("game.{action}"), payload) {
            Ok(event) => event.with_source("points_ledger"),
            Err(err) => {
                warn!(error = %err, "failed to build balance event");
                return;
            }
        };
        if let Err(err) = self.bus.publish(event).await {
            warn!(error = %err, "failed to publish balance event");
        }
    }
}

#[async_trait]
impl Ledger for PointsLedger {
    async fn award_points(&self, request: AwardRequest) -> AwardResult {
        let mut last_transient = None;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_backoff * 2u32.pow(attempt - 1)).await;
            }
            match self.try_award(&request).await {
                Ok(Attempt::Done(result)) => return result,
                Ok(Attempt::Committed { result, record }) => {
                    self.publish_balance_event("points_awarded", &record).await;
                    return result;
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        user = %request.user_id,
                        attempt = attempt + 1,
                        error = %err,
                        "transient store conflict, retrying award"
                    );
                    last_transient = Some(err);
                }
                Err(err) => {
                    let balance = self
                        .balance_snapshot(request.user_id)
                        .await
                        .unwrap_or((0, 0));
                    return AwardResult::failed(err.to_string(), balance);
                }
            }
        }

        let error = LedgerError::RetriesExhausted {
            attempts: self.config.max_attempts,
            last: last_transient.map(|e| e.to_string()).unwrap_or_default(),
        };
        let balance = self
            .balance_snapshot(request.user_id)
            .await
            .unwrap_or((0, 0));
        AwardResult::failed(error.to_string(), balance)
    }

    async fn spend_points(
        &self,
        user_id: UserId,
        amount: u64,
        reason: &str,
        context: Option<ActionContext>,
    ) -> Result<bool, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::Constraint(
                "spend amount must be positive".to_string(),
            ));
        }

        let mut last_transient = None;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_backoff * 2u32.pow(attempt - 1)).await;
            }
            match self
                .try_spend(user_id, amount, reason, context.as_ref())
                .await
            {
                Ok(SpendOutcome::Insufficient) => return Ok(false),
                Ok(SpendOutcome::Spent(record)) => {
                    self.publish_balance_event("points_spent", &record).await;
                    return Ok(true);
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        user = %user_id,
                        attempt = attempt + 1,
                        error = %err,
                        "transient store conflict, retrying spend"
                    );
                    last_transient = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(LedgerError::RetriesExhausted {
            attempts: self.config.max_attempts,
            last: last_transient.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn get_user_balance(&self, user_id: UserId) -> Result<(u64, u64), LedgerError> {
        Ok(self.balance_snapshot(user_id).await?)
    }

    async fn get_transaction_history(
        &self,
        user_id: UserId,
        limit: usize,
        action_types: Option<&[ActionType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PointsTransaction>, LedgerError> {
        Ok(self
            .store
            .transactions(user_id, limit, action_types, since)
            .await?)
    }

    async fn verify_balance_integrity(&self, user_id: UserId) -> Result<bool, LedgerError> {
        let history = self.store.full_history(user_id).await?;
        let stored = self.store.balance(user_id).await?;

        let mut folded = UserBalance::new(user_id);
        for row in &history {
            if row.action_type == ActionType::Spend {
                if !folded.apply_spend(row.points_change.unsigned_abs()) {
                    return Ok(false);
                }
            } else {
                folded.apply_award(row.points_change);
            }
        }

        Ok(match stored {
            Some(balance) => balance == folded,
            None => history.is_empty(),
        })
    }
}

async fn rollback_quietly(tx: Box<dyn LedgerTx>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "rollback failed after aborted operation");
    }
}
