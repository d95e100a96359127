//! # Award Flow Demo
//!
//! End-to-end run of the besitos ledger on the in-memory store: awards,
//! a rejection, a spend, and event delivery with replay for a late joiner.

use anyhow::Result;
use async_trait::async_trait;
use besitos_core::{
    ActionContext, ActionType, AwardRequest, Event, EventBus, EventDistributor, EventHandler,
    Ledger, MemoryStore, PointsLedger, SubscriptionTier, UserId,
};
use std::sync::Arc;

// ============================================================================
// A subscriber that just prints what it sees
// ============================================================================

struct Printer {
    name: String,
}

#[async_trait]
impl EventHandler for Printer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        println!(
            "  [{}] {} -> {}",
            self.name, event.event_type, event.data
        );
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::default());
    let ledger = PointsLedger::new(store, bus.clone());

    bus.subscribe(
        "game.*",
        Arc::new(Printer {
            name: "notifier".to_string(),
        }),
    )?;

    let user = UserId(1);

    println!("Daily login:");
    let login = ledger
        .award_points(AwardRequest::new(1, ActionType::DailyLogin))
        .await;
    println!("  awarded {} besitos", login.points_awarded);

    println!("Message with VIP + streak multipliers:");
    let message = ledger
        .award_points(
            AwardRequest::new(1, ActionType::MessageSent).with_context(
                ActionContext::new()
                    .with_tier(SubscriptionTier::Vip)
                    .with_streak(7),
            ),
        )
        .await;
    println!(
        "  awarded {} besitos (base {}, multipliers {:?})",
        message.points_awarded, message.base_points, message.multipliers_applied
    );

    println!("Second daily login (rejected by the rate ceiling):");
    let again = ledger
        .award_points(AwardRequest::new(1, ActionType::DailyLogin))
        .await;
    println!("  success={} violation={:?}", again.success, again.violation);

    println!("Spending 20 besitos on a sticker pack:");
    let spent = ledger.spend_points(user, 20, "sticker pack", None).await?;
    println!("  spent={spent}");

    let (total, available) = ledger.get_user_balance(user).await?;
    println!("Balance: total={total} available={available}");
    println!(
        "Integrity check: {}",
        ledger.verify_balance_integrity(user).await?
    );

    println!("Late joiner catches up via replay:");
    bus.subscribe(
        "game.*",
        Arc::new(Printer {
            name: "latecomer".to_string(),
        }),
    )?;
    bus.replay_events(None, None, Some(&["latecomer"])).await?;

    let stats = bus.get_statistics();
    println!(
        "Bus stats: published={} handler_invocations={} failures={}",
        stats.events_published, stats.handler_invocations, stats.handler_failures
    );

    Ok(())
}
