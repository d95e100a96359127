//! End-to-end ledger scenarios over the in-memory store.

use crate::{
    AbuseConfig, ActionContext, ActionType, AwardRequest, EventBus, Ledger, LedgerConfig,
    LedgerStore, MemoryStore, MultiplierConfig, PointsLedger, SubscriptionTier, UserId,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> LedgerConfig {
    LedgerConfig {
        retry_backoff: Duration::from_millis(1),
        ..LedgerConfig::default()
    }
}

fn ledger_over(store: Arc<dyn LedgerStore>) -> (PointsLedger, Arc<EventBus>) {
    let bus = Arc::new(EventBus::default());
    let ledger = PointsLedger::with_config(
        store,
        bus.clone(),
        fast_config(),
        AbuseConfig::default(),
        MultiplierConfig::default(),
    );
    (ledger, bus)
}

fn memory_ledger() -> (PointsLedger, Arc<EventBus>) {
    ledger_over(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn daily_login_then_message_then_forced_adjustment() {
    let (ledger, _bus) = memory_ledger();
    let user = UserId(1);

    let login = ledger
        .award_points(AwardRequest::new(1, ActionType::DailyLogin))
        .await;
    assert!(login.success, "{login:?}");
    assert_eq!(login.points_awarded, 50);

    let message = ledger
        .award_points(AwardRequest::new(1, ActionType::MessageSent).with_points(5))
        .await;
    assert!(message.success);
    assert_eq!(ledger.get_user_balance(user).await.unwrap(), (55, 55));

    // Forced admin adjustment drives the signed sum deep negative; the
    // reported balance clamps at zero.
    let adjust = ledger
        .award_points(
            AwardRequest::new(1, ActionType::AdminAdjustment)
                .with_points(-1000)
                .forced(),
        )
        .await;
    assert!(adjust.success);
    assert_eq!(ledger.get_user_balance(user).await.unwrap(), (0, 0));

    // The log still records the exact delta.
    let history = ledger
        .get_transaction_history(user, 10, None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].points_change, -1000);
    assert!(!history[0].validation_passed, "forced awards are marked");

    assert!(ledger.verify_balance_integrity(user).await.unwrap());
}

#[tokio::test]
async fn rejection_reports_current_balance_and_mutates_nothing() {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::default());
    let abuse = AbuseConfig {
        ceilings: [(ActionType::MessageSent, 1)].into_iter().collect(),
        ..AbuseConfig::default()
    };
    let ledger = PointsLedger::with_config(
        store.clone(),
        bus,
        fast_config(),
        abuse,
        MultiplierConfig::default(),
    );
    let user = UserId(9);

    let first = ledger
        .award_points(
            AwardRequest::new(9, ActionType::MessageSent)
                .with_context(ActionContext::new().with_dedupe_key("m1")),
        )
        .await;
    assert!(first.success);

    let second = ledger
        .award_points(
            AwardRequest::new(9, ActionType::MessageSent)
                .with_context(ActionContext::new().with_dedupe_key("m2")),
        )
        .await;
    assert!(!second.success);
    assert!(second.violation.is_some());
    assert_eq!(second.new_balance, (1, 1), "balance reported unchanged");

    assert_eq!(store.full_history(user).await.unwrap().len(), 1);
    assert!(ledger.verify_balance_integrity(user).await.unwrap());
}

#[tokio::test]
async fn force_bypasses_validation() {
    let abuse = AbuseConfig {
        ceilings: [(ActionType::MessageSent, 0)].into_iter().collect(),
        ..AbuseConfig::default()
    };
    let ledger = PointsLedger::with_config(
        Arc::new(MemoryStore::new()),
        Arc::new(EventBus::default()),
        fast_config(),
        abuse,
        MultiplierConfig::default(),
    );

    let normal = ledger
        .award_points(AwardRequest::new(3, ActionType::MessageSent))
        .await;
    assert!(!normal.success);

    let forced = ledger
        .award_points(AwardRequest::new(3, ActionType::MessageSent).forced())
        .await;
    assert!(forced.success);
}

#[tokio::test]
async fn non_positive_amounts_are_rejected_before_any_mutation() {
    let (ledger, _bus) = memory_ledger();

    for points in [0, -5] {
        let result = ledger
            .award_points(AwardRequest::new(2, ActionType::MessageSent).with_points(points))
            .await;
        assert!(!result.success);
        assert!(result.error_message.is_some());
    }

    // No configured constant and no context amount either.
    let missing = ledger
        .award_points(AwardRequest::new(2, ActionType::AchievementUnlocked))
        .await;
    assert!(!missing.success);

    assert!(ledger
        .get_transaction_history(UserId(2), 10, None, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn variable_amounts_come_from_the_context() {
    let (ledger, _bus) = memory_ledger();

    let granted = ledger
        .award_points(
            AwardRequest::new(4, ActionType::AchievementUnlocked)
                .with_context(ActionContext::new().with_amount(25)),
        )
        .await;
    assert!(granted.success, "{granted:?}");
    assert_eq!(granted.points_awarded, 25);
}

#[tokio::test]
async fn multipliers_scale_awards_with_floor_rounding() {
    let (ledger, _bus) = memory_ledger();

    let context = ActionContext::new()
        .with_tier(SubscriptionTier::Vip) // 1.5
        .with_streak(10); // 1.5
    let result = ledger
        .award_points(
            AwardRequest::new(5, ActionType::MessageSent)
                .with_points(7)
                .with_context(context),
        )
        .await;

    assert!(result.success);
    assert_eq!(result.base_points, 7);
    // 7 * 1.5 * 1.5 = 15.75, floored.
    assert_eq!(result.points_awarded, 15);
    assert_eq!(result.multipliers_applied.len(), 2);
}

#[tokio::test]
async fn spend_debits_available_only_and_refuses_overdraw() {
    let (ledger, _bus) = memory_ledger();
    let user = UserId(6);

    ledger
        .award_points(AwardRequest::new(6, ActionType::DailyLogin))
        .await;

    // Overdraw: refused, nothing recorded.
    assert!(!ledger
        .spend_points(user, 60, "too expensive", None)
        .await
        .unwrap());
    assert_eq!(ledger.get_user_balance(user).await.unwrap(), (50, 50));

    assert!(ledger
        .spend_points(user, 20, "sticker pack", None)
        .await
        .unwrap());
    assert_eq!(ledger.get_user_balance(user).await.unwrap(), (50, 30));

    let history = ledger
        .get_transaction_history(user, 10, Some(&[ActionType::Spend]), None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].points_change, -20);
    assert_eq!(history[0].context.note.as_deref(), Some("sticker pack"));

    assert!(ledger.verify_balance_integrity(user).await.unwrap());
}

#[tokio::test]
async fn spending_from_an_unknown_user_is_refused() {
    let (ledger, _bus) = memory_ledger();
    assert!(!ledger
        .spend_points(UserId(404), 1, "anything", None)
        .await
        .unwrap());
}

#[tokio::test]
async fn zero_spend_is_a_constraint_error() {
    let (ledger, _bus) = memory_ledger();
    assert!(ledger
        .spend_points(UserId(1), 0, "nothing", None)
        .await
        .is_err());
}

#[tokio::test]
async fn history_filters_by_type_and_time() {
    let (ledger, _bus) = memory_ledger();
    let user = UserId(12);

    ledger
        .award_points(AwardRequest::new(12, ActionType::DailyLogin))
        .await;
    let midpoint = chrono::Utc::now();
    ledger
        .award_points(
            AwardRequest::new(12, ActionType::MessageSent)
                .with_context(ActionContext::new().with_dedupe_key("later")),
        )
        .await;

    let logins = ledger
        .get_transaction_history(user, 10, Some(&[ActionType::DailyLogin]), None)
        .await
        .unwrap();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].action_type, ActionType::DailyLogin);

    let recent = ledger
        .get_transaction_history(user, 10, None, Some(midpoint))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].action_type, ActionType::MessageSent);
}
