//! Typed configuration for the ledger, validator, multipliers, and bus.
//!
//! Numbers here are defaults, not mandates; every knob is a plain field so
//! deployments can tune them at construction time.

use crate::model::{ActionType, SubscriptionTier};
use std::collections::BTreeMap;
use std::time::Duration;

/// Ledger-level tuning: base point values, retry policy, deadlines.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Configured constant per action type. Types absent here must supply
    /// their amount explicitly or through the context.
    pub base_points: BTreeMap<ActionType, i64>,
    /// Attempts per logical operation when the store reports a transient
    /// conflict. The first attempt counts.
    pub max_attempts: u32,
    /// Backoff before retry `n` is `retry_backoff * 2^(n-1)`.
    pub retry_backoff: Duration,
    /// Optional per-operation deadline for the transactional section.
    /// On elapse the transaction is rolled back before the call returns.
    pub operation_timeout: Option<Duration>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let mut base_points = BTreeMap::new();
        base_points.insert(ActionType::DailyLogin, 50);
        base_points.insert(ActionType::MessageSent, 1);
        base_points.insert(ActionType::ReactionAdded, 2);
        Self {
            base_points,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            operation_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Anti-abuse heuristics tuning.
#[derive(Debug, Clone)]
pub struct AbuseConfig {
    /// Sliding-window width for rate ceilings.
    pub window: Duration,
    /// Per-action ceilings inside the window; `default_ceiling` covers the
    /// rest.
    pub ceilings: BTreeMap<ActionType, u32>,
    pub default_ceiling: u32,
    /// How many recent contexts are kept per user for duplicate detection.
    pub context_buffer: usize,
    /// Identical contexts tolerated inside the buffer before the action is
    /// flagged as a scripted replay.
    pub duplicate_tolerance: u32,
    /// A violation inside this interval of the previous one raises the
    /// escalation level.
    pub escalation_cooldown: Duration,
    /// A violation-free interval this long resets escalation to zero.
    pub escalation_reset: Duration,
    /// Suppression after a violation is `base_suppression * 2^level`.
    pub base_suppression: Duration,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        let mut ceilings = BTreeMap::new();
        ceilings.insert(ActionType::DailyLogin, 1);
        ceilings.insert(ActionType::MessageSent, 30);
        ceilings.insert(ActionType::ReactionAdded, 60);
        Self {
            window: Duration::from_secs(60),
            ceilings,
            default_ceiling: 20,
            context_buffer: 16,
            duplicate_tolerance: 2,
            escalation_cooldown: Duration::from_secs(300),
            escalation_reset: Duration::from_secs(3600),
            base_suppression: Duration::from_secs(60),
        }
    }
}

/// Multiplier derivation tuning.
#[derive(Debug, Clone)]
pub struct MultiplierConfig {
    pub tier_factors: BTreeMap<SubscriptionTier, f64>,
    /// Streak bonus per consecutive day, on top of 1.0.
    pub streak_step: f64,
    /// Upper bound for the streak factor.
    pub streak_cap: f64,
    /// Upper bound for a caller-supplied event bonus factor.
    pub event_bonus_cap: f64,
}

impl Default for MultiplierConfig {
    fn default() -> Self {
        let mut tier_factors = BTreeMap::new();
        tier_factors.insert(SubscriptionTier::Free, 1.0);
        tier_factors.insert(SubscriptionTier::Supporter, 1.25);
        tier_factors.insert(SubscriptionTier::Vip, 1.5);
        Self {
            tier_factors,
            streak_step: 0.05,
            streak_cap: 2.0,
            event_bonus_cap: 3.0,
        }
    }
}

/// Event bus retention and health thresholds.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Size bound for the in-memory retention window.
    pub max_retained: usize,
    /// Handler failure ratio (per mille) above which `health_check` reports
    /// degraded.
    pub degraded_failure_per_mille: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retained: 1024,
            degraded_failure_per_mille: 100,
        }
    }
}
