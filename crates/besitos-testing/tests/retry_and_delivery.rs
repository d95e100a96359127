//! The ledger's retry and event-publication contracts, exercised through
//! the conflict-injecting store and the recording handler.

use besitos_core::{
    AbuseConfig, ActionType, AwardRequest, EventBus, EventDistributor, Ledger, LedgerConfig,
    LedgerStore, MemoryStore, MultiplierConfig, PointsLedger, UserId,
};
use besitos_testing::{ConflictStore, RecordingHandler};
use std::sync::Arc;
use std::time::Duration;

fn fast_ledger(store: Arc<dyn LedgerStore>, bus: Arc<EventBus>, abuse: AbuseConfig) -> PointsLedger {
    PointsLedger::with_config(
        store,
        bus,
        LedgerConfig {
            retry_backoff: Duration::from_millis(1),
            ..LedgerConfig::default()
        },
        abuse,
        MultiplierConfig::default(),
    )
}

#[tokio::test]
async fn transient_conflicts_are_retried_with_exactly_one_committed_row() {
    let store = Arc::new(ConflictStore::new(MemoryStore::new(), 2));
    let ledger = fast_ledger(
        store.clone(),
        Arc::new(EventBus::default()),
        AbuseConfig::default(),
    );
    let user = UserId(7);

    let result = ledger
        .award_points(AwardRequest::new(7, ActionType::DailyLogin))
        .await;

    assert!(result.success, "third attempt should succeed: {result:?}");
    assert_eq!(store.remaining_conflicts(), 0);

    // Retry transparency: one logical call, exactly one row and one delta.
    let history = store.full_history(user).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(ledger.get_user_balance(user).await.unwrap(), (50, 50));
}

#[tokio::test]
async fn exhausted_retries_fail_with_no_persisted_state() {
    let store = Arc::new(ConflictStore::new(MemoryStore::new(), 10));
    let ledger = fast_ledger(
        store.clone(),
        Arc::new(EventBus::default()),
        AbuseConfig::default(),
    );

    let result = ledger
        .award_points(AwardRequest::new(8, ActionType::DailyLogin))
        .await;

    assert!(!result.success);
    assert!(result.error_message.is_some());
    assert_eq!(result.new_balance, (0, 0));
    assert!(store.full_history(UserId(8)).await.unwrap().is_empty());
}

#[tokio::test]
async fn committed_changes_publish_events_rejected_ones_do_not() {
    let bus = Arc::new(EventBus::default());
    let abuse = AbuseConfig {
        ceilings: [(ActionType::DailyLogin, 1)].into_iter().collect(),
        ..AbuseConfig::default()
    };
    let ledger = fast_ledger(Arc::new(MemoryStore::new()), bus.clone(), abuse);

    let handler = RecordingHandler::new("notifier");
    bus.subscribe("game.*", handler.clone()).unwrap();

    ledger
        .award_points(AwardRequest::new(11, ActionType::DailyLogin))
        .await;
    ledger
        .spend_points(UserId(11), 10, "gift", None)
        .await
        .unwrap();
    // Second login inside the window: rejected, no event.
    ledger
        .award_points(AwardRequest::new(11, ActionType::DailyLogin))
        .await;

    assert_eq!(
        handler.event_types(),
        vec!["game.points_awarded", "game.points_spent"]
    );

    let payload = &handler.events()[0].data;
    assert_eq!(payload["user_id"], 11);
    assert_eq!(payload["points_change"], 50);
    assert_eq!(payload["balance_after"], 50);
}

#[tokio::test]
async fn failing_handler_does_not_block_the_ledger_or_other_handlers() {
    let bus = Arc::new(EventBus::default());
    let ledger = fast_ledger(
        Arc::new(MemoryStore::new()),
        bus.clone(),
        AbuseConfig::default(),
    );

    let flaky = RecordingHandler::new("flaky");
    flaky.fail_next(1);
    let steady = RecordingHandler::new("steady");
    bus.subscribe("game.*", flaky.clone()).unwrap();
    bus.subscribe("game.*", steady.clone()).unwrap();

    let result = ledger
        .award_points(AwardRequest::new(12, ActionType::DailyLogin))
        .await;
    assert!(result.success, "handler failure must not fail the award");
    assert_eq!(flaky.len(), 1);
    assert_eq!(steady.len(), 1);
    assert_eq!(bus.get_statistics().handler_failures, 1);
}
