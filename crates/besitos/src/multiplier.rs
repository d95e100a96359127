//! Pure derivation of scaling factors from caller-supplied state.
//!
//! No I/O happens here: whatever user or campaign state a factor needs
//! arrives in the [`ActionContext`]. Factors combine multiplicatively and
//! the ledger floors the scaled product before persistence.

use crate::config::MultiplierConfig;
use crate::model::{ActionContext, ActionType, MultiplierKind, MultiplierMap, UserId};

pub struct MultiplierCalculator {
    config: MultiplierConfig,
}

impl MultiplierCalculator {
    pub fn new(config: MultiplierConfig) -> Self {
        Self { config }
    }

    /// Derive every applicable factor for this action. Administrative
    /// adjustments and spends are exempt and get an empty map.
    pub fn calculate_multipliers(
        &self,
        _user_id: UserId,
        action_type: ActionType,
        context: &ActionContext,
    ) -> MultiplierMap {
        let mut multipliers = MultiplierMap::new();
        if !action_type.takes_multipliers() {
            return multipliers;
        }

        if let Some(tier) = context.subscription_tier {
            if let Some(&factor) = self.config.tier_factors.get(&tier) {
                multipliers.insert(MultiplierKind::SubscriptionTier, factor);
            }
        }

        if let Some(days) = context.streak_days {
            let factor =
                (1.0 + self.config.streak_step * days as f64).min(self.config.streak_cap);
            multipliers.insert(MultiplierKind::ActivityStreak, factor);
        }

        if let Some(bonus) = context.event_bonus {
            // Non-finite or non-positive caller input is ignored, not clamped
            // into something surprising.
            if bonus.is_finite() && bonus > 0.0 {
                multipliers.insert(
                    MultiplierKind::EventBonus,
                    bonus.min(self.config.event_bonus_cap),
                );
            }
        }

        multipliers
    }

    /// Multiplicative fold of all factors. Empty map means 1.0.
    pub fn combined_factor(multipliers: &MultiplierMap) -> f64 {
        multipliers.values().product()
    }

    /// Scale base points by the combined factor, rounding toward negative
    /// infinity.
    pub fn apply(base_points: i64, multipliers: &MultiplierMap) -> i64 {
        (base_points as f64 * Self::combined_factor(multipliers)).floor() as i64
    }
}

impl Default for MultiplierCalculator {
    fn default() -> Self {
        Self::new(MultiplierConfig::default())
    }
}
