//! Rate and pattern heuristics gating point awards.
//!
//! Per-user state lives here and nowhere else. The window and context
//! buffer are fed exclusively by [`AntiAbuseValidator::record_action`],
//! which the ledger calls only after a successful commit — rejected
//! attempts never pollute the rate-limit window. Escalation bookkeeping is
//! the one exception: it tracks *violations*, so it mutates when a
//! violation is detected.

use crate::config::AbuseConfig;
use crate::error::{Violation, ViolationKind};
use crate::model::{ActionContext, ActionType, UserId};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

// Bounds the suppression exponent; 2^10 * base is already over an hour at
// the default base.
const MAX_ESCALATION_LEVEL: u32 = 10;

#[derive(Default)]
struct AbuseHistory {
    /// Committed actions inside the sliding window, oldest first.
    recent: VecDeque<(DateTime<Utc>, ActionType)>,
    /// Bounded buffer of committed contexts for duplicate detection.
    recent_contexts: VecDeque<(ActionType, ActionContext)>,
    escalation: u32,
    last_violation_at: Option<DateTime<Utc>>,
    suppressed_until: Option<DateTime<Utc>>,
}

impl AbuseHistory {
    fn expire_before(&mut self, cutoff: DateTime<Utc>) {
        while self.recent.front().is_some_and(|(at, _)| *at < cutoff) {
            self.recent.pop_front();
        }
    }
}

/// Stateless-per-call validator over per-user histories it owns.
pub struct AntiAbuseValidator {
    config: AbuseConfig,
    histories: DashMap<UserId, AbuseHistory>,
}

impl AntiAbuseValidator {
    pub fn new(config: AbuseConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
        }
    }

    /// Gate an action. `Err` carries the violation kind and a message for
    /// the caller-facing result; the window is left untouched.
    pub fn validate_action(
        &self,
        user_id: UserId,
        action_type: ActionType,
        context: &ActionContext,
    ) -> Result<(), Violation> {
        self.validate_at(Utc::now(), user_id, action_type, context)
    }

    /// Record a committed action. Call only after the award's transaction
    /// committed.
    pub fn record_action(
        &self,
        user_id: UserId,
        action_type: ActionType,
        context: &ActionContext,
        _points_change: i64,
    ) {
        self.record_at(Utc::now(), user_id, action_type, context);
    }

    /// Current escalation level, for observability.
    pub fn escalation_level(&self, user_id: UserId) -> u32 {
        self.histories.get(&user_id).map_or(0, |h| h.escalation)
    }

    fn validate_at(
        &self,
        now: DateTime<Utc>,
        user_id: UserId,
        action_type: ActionType,
        context: &ActionContext,
    ) -> Result<(), Violation> {
        let mut history = self.histories.entry(user_id).or_default();

        // Sustained clean interval resets escalation.
        if let Some(last) = history.last_violation_at {
            if now - last >= delta(self.config.escalation_reset) {
                history.escalation = 0;
                history.last_violation_at = None;
            }
        }

        if let Some(until) = history.suppressed_until {
            if now < until {
                return Err(Violation::new(
                    ViolationKind::Suppressed,
                    format!("suppressed until {} (escalation level {})", until, history.escalation),
                ));
            }
            history.suppressed_until = None;
        }

        history.expire_before(now - delta(self.config.window));

        let ceiling = self
            .config
            .ceilings
            .get(&action_type)
            .copied()
            .unwrap_or(self.config.default_ceiling);
        let in_window = history
            .recent
            .iter()
            .filter(|(_, ty)| *ty == action_type)
            .count() as u32;
        if in_window >= ceiling {
            self.note_violation(&mut history, now, user_id, action_type);
            return Err(Violation::new(
                ViolationKind::RateLimit,
                format!("{action_type}: {in_window} actions in window, ceiling {ceiling}"),
            ));
        }

        let duplicates = history
            .recent_contexts
            .iter()
            .filter(|(ty, ctx)| *ty == action_type && ctx == context)
            .count() as u32;
        if duplicates >= self.config.duplicate_tolerance {
            self.note_violation(&mut history, now, user_id, action_type);
            return Err(Violation::new(
                ViolationKind::DuplicatePattern,
                format!("{action_type}: {duplicates} identical recent contexts"),
            ));
        }

        Ok(())
    }

    fn record_at(
        &self,
        now: DateTime<Utc>,
        user_id: UserId,
        action_type: ActionType,
        context: &ActionContext,
    ) {
        let mut history = self.histories.entry(user_id).or_default();
        history.expire_before(now - delta(self.config.window));
        history.recent.push_back((now, action_type));
        history
            .recent_contexts
            .push_back((action_type, context.clone()));
        while history.recent_contexts.len() > self.config.context_buffer {
            history.recent_contexts.pop_front();
        }
    }

    fn note_violation(
        &self,
        history: &mut AbuseHistory,
        now: DateTime<Utc>,
        user_id: UserId,
        action_type: ActionType,
    ) {
        let repeat = history
            .last_violation_at
            .is_some_and(|last| now - last <= delta(self.config.escalation_cooldown));
        if repeat {
            history.escalation = (history.escalation + 1).min(MAX_ESCALATION_LEVEL);
        }
        history.last_violation_at = Some(now);
        let suppression = self.config.base_suppression * 2u32.pow(history.escalation);
        history.suppressed_until = Some(now + delta(suppression));
        debug!(
            user = %user_id,
            action = %action_type,
            escalation = history.escalation,
            "anti-abuse violation recorded"
        );
    }
}

impl Default for AntiAbuseValidator {
    fn default() -> Self {
        Self::new(AbuseConfig::default())
    }
}

fn delta(d: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
