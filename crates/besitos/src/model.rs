//! Domain records: users, action types, contexts, transactions, balances.
//!
//! [`PointsTransaction`] rows are the append-only audit trail; [`UserBalance`]
//! is the mutable projection over them. The clamp rules live on
//! [`UserBalance`] so the ledger's write path and the integrity fold apply
//! exactly the same arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque caller-supplied user identifier. The ledger never interprets it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id)
    }
}

/// Categorical trigger for a point award.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    DailyLogin,
    MessageSent,
    ReactionAdded,
    AchievementUnlocked,
    AdminAdjustment,
    Spend,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::DailyLogin => "daily_login",
            ActionType::MessageSent => "message_sent",
            ActionType::ReactionAdded => "reaction_added",
            ActionType::AchievementUnlocked => "achievement_unlocked",
            ActionType::AdminAdjustment => "admin_adjustment",
            ActionType::Spend => "spend",
        }
    }

    /// Action types permitted to carry a zero or negative delta.
    pub fn is_adjustment_capable(&self) -> bool {
        matches!(self, ActionType::AdminAdjustment)
    }

    /// Action types whose amount is inherently variable and comes from the
    /// context rather than a configured constant.
    pub fn amount_from_context(&self) -> bool {
        matches!(
            self,
            ActionType::AchievementUnlocked | ActionType::AdminAdjustment
        )
    }

    /// Action types subject to multiplier scaling.
    pub fn takes_multipliers(&self) -> bool {
        !matches!(self, ActionType::AdminAdjustment | ActionType::Spend)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_login" => Ok(ActionType::DailyLogin),
            "message_sent" => Ok(ActionType::MessageSent),
            "reaction_added" => Ok(ActionType::ReactionAdded),
            "achievement_unlocked" => Ok(ActionType::AchievementUnlocked),
            "admin_adjustment" => Ok(ActionType::AdminAdjustment),
            "spend" => Ok(ActionType::Spend),
            other => Err(format!("unknown action type `{other}`")),
        }
    }
}

/// Subscription tier supplied by the caller; the ledger performs no identity
/// lookups of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Supporter,
    Vip,
}

/// Kind of scaling factor applied to base points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplierKind {
    SubscriptionTier,
    ActivityStreak,
    EventBonus,
}

/// Map of multiplier kind to factor, combined multiplicatively.
pub type MultiplierMap = BTreeMap<MultiplierKind, f64>;

/// Structured per-call context with an enumerated key set.
///
/// Equality over the whole struct drives duplicate-pattern detection, so
/// callers that legitimately repeat an action should vary `dedupe_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionContext {
    /// User's subscription tier, if the caller knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_tier: Option<SubscriptionTier>,
    /// Consecutive activity days, feeds the streak multiplier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak_days: Option<u32>,
    /// Time-limited event bonus factor supplied by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_bonus: Option<f64>,
    /// Variable amount for achievement grants and admin adjustments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    /// Free-form annotation (spend reason, adjustment rationale).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Discriminator for otherwise-identical repeated actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl ActionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_tier(mut self, tier: SubscriptionTier) -> Self {
        self.subscription_tier = Some(tier);
        self
    }

    pub fn with_streak(mut self, days: u32) -> Self {
        self.streak_days = Some(days);
        self
    }

    pub fn with_event_bonus(mut self, factor: f64) -> Self {
        self.event_bonus = Some(factor);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// One committed award or spend. Immutable once written; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub action_type: ActionType,
    /// Exact signed delta, even where the balance projection clamps.
    pub points_change: i64,
    /// Clamped total after this row was applied.
    pub balance_after: u64,
    pub base_points: i64,
    pub multipliers_applied: MultiplierMap,
    pub context: ActionContext,
    pub created_at: DateTime<Utc>,
    /// False when the award was forced past validation.
    pub validation_passed: bool,
}

/// Per-user balance projection.
///
/// `signed_total` is the exact sum of award deltas (spends excluded) and is
/// what keeps a deeply negative adjustment "remembered": after a forced
/// `-1000`, later awards stay clamped at zero until the signed sum recovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: UserId,
    /// Lifetime earned, clamped at zero. Equals `max(signed_total, 0)`.
    pub total_points: u64,
    /// Spendable. Never exceeds `total_points`.
    pub available_points: u64,
    /// Exact signed sum of award deltas, kept for audit.
    pub signed_total: i64,
}

impl UserBalance {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            total_points: 0,
            available_points: 0,
            signed_total: 0,
        }
    }

    /// Apply an award delta (positive or negative), maintaining the clamp
    /// invariants.
    pub fn apply_award(&mut self, delta: i64) {
        self.signed_total += delta;
        self.total_points = self.signed_total.max(0) as u64;
        if delta >= 0 {
            self.available_points = (self.available_points + delta as u64).min(self.total_points);
        } else {
            self.available_points = self
                .available_points
                .saturating_sub(delta.unsigned_abs())
                .min(self.total_points);
        }
    }

    /// Debit spendable points only. Returns false (and changes nothing) on
    /// insufficient funds. Lifetime total and the signed accumulator are
    /// untouched: spending consumes purchasing power, not score.
    pub fn apply_spend(&mut self, amount: u64) -> bool {
        if self.available_points < amount {
            return false;
        }
        self.available_points -= amount;
        true
    }
}

/// Outcome of an `award_points` call. Failures carry the unchanged balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardResult {
    pub success: bool,
    pub points_awarded: i64,
    pub base_points: i64,
    pub multipliers_applied: MultiplierMap,
    /// `(total_points, available_points)` after the call.
    pub new_balance: (u64, u64),
    pub transaction_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AwardResult {
    pub(crate) fn rejected(violation: &crate::error::Violation, balance: (u64, u64)) -> Self {
        Self {
            success: false,
            points_awarded: 0,
            base_points: 0,
            multipliers_applied: MultiplierMap::new(),
            new_balance: balance,
            transaction_id: None,
            violation: Some(violation.to_string()),
            error_message: None,
        }
    }

    pub(crate) fn failed(message: impl Into<String>, balance: (u64, u64)) -> Self {
        Self {
            success: false,
            points_awarded: 0,
            base_points: 0,
            multipliers_applied: MultiplierMap::new(),
            new_balance: balance,
            transaction_id: None,
            violation: None,
            error_message: Some(message.into()),
        }
    }
}

/// Parameters for a single award. `explicit_points` overrides the configured
/// constant; `force` bypasses anti-abuse validation (admin paths).
#[derive(Debug, Clone)]
pub struct AwardRequest {
    pub user_id: UserId,
    pub action_type: ActionType,
    pub context: ActionContext,
    pub explicit_points: Option<i64>,
    pub force: bool,
}

impl AwardRequest {
    pub fn new(user_id: impl Into<UserId>, action_type: ActionType) -> Self {
        Self {
            user_id: user_id.into(),
            action_type,
            context: ActionContext::default(),
            explicit_points: None,
            force: false,
        }
    }

    pub fn with_context(mut self, context: ActionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_points(mut self, points: i64) -> Self {
        self.explicit_points = Some(points);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}
