//! # Besitos
//!
//! A points ledger and anti-abuse engine: awards validate, balances mutate
//! atomically, and events announce what happened.
//!
//! ## Core Concepts
//!
//! Besitos separates **money-like state** from **notification**:
//! - [`PointsLedger`] = Authority (the only thing that mutates balances)
//! - [`EventBus`] = Announcement (what happened, delivered to whoever cares)
//!
//! The key principle: **One Award = One Transaction = One Event**.
//! A balance change that was not committed was never announced.
//!
//! ## Architecture
//!
//! ```text
//! Caller (chat adapter, admin tool)
//!     │
//!     ▼ award_points() / spend_points()
//! PointsLedger ── per-user lock, acquired once ──┐
//!     │                                          │
//!     ├─► AntiAbuseValidator.validate_action()   │
//!     │        │ reject ─► failed result,        │
//!     │        ▼           balance untouched     │
//!     ├─► MultiplierCalculator (pure)            │
//!     │                                          │
//!     ▼ begin ─ insert tx row ─ write balance ─ commit
//! LedgerStore (opaque, transactional)            │
//!     │ conflict? release lock, retry whole op   │
//!     ▼ committed                                │
//! EventBus.publish("game.points_awarded") ◄──────┘
//!     │
//!     ├─► handler A (isolated: failure logged, never propagated)
//!     ├─► handler B
//!     └─► retention window ─► replay for late joiners
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Clamped total, exact audit** - `total_points == max(Σ award deltas, 0)`;
//!    the transaction log keeps the true signed values
//! 2. **Spends consume purchasing power** - `available_points` only;
//!    lifetime total untouched
//! 3. **No partial application** - any failure rolls back fully; failure
//!    results report the pre-call balance
//! 4. **Per-user serialization** - one user's operations are mutually
//!    exclusive and ordered; distinct users run fully in parallel
//! 5. **Events are validated facts** - an [`Event`] that fails construction
//!    never exists, and a committed change is published exactly once per
//!    logical operation (replay is at-least-once on top)
//! 6. **Rejections leave no trace** - a rejected attempt touches neither the
//!    store nor the rate-limit window
//!
//! ## Example
//!
//! ```ignore
//! use besitos_core::{
//!     ActionContext, ActionType, AwardRequest, EventBus, Ledger, MemoryStore, PointsLedger,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let bus = Arc::new(EventBus::default());
//! let ledger = PointsLedger::new(store, bus.clone());
//!
//! let result = ledger
//!     .award_points(AwardRequest::new(1, ActionType::DailyLogin))
//!     .await;
//! assert!(result.success);
//!
//! let spent = ledger.spend_points(1.into(), 20, "sticker pack", None).await?;
//! assert!(spent);
//! ```
//!
//! ## What This Is Not
//!
//! Besitos is **not**:
//! - A general-purpose financial ledger (no multi-currency, no double entry)
//! - An identity or account store (user ids are opaque)
//! - A durable message broker (the bus retention window is bounded;
//!   replay is catch-up, not an event-sourcing log)

// Core modules
mod antiabuse;
mod bus;
mod config;
mod error;
mod event;
mod ledger;
mod model;
mod multiplier;
mod store;

// Ledger scenario tests (test-only)
#[cfg(test)]
mod ledger_scenarios;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export the domain model
pub use crate::model::{
    ActionContext, ActionType, AwardRequest, AwardResult, MultiplierKind, MultiplierMap,
    PointsTransaction, SubscriptionTier, UserBalance, UserId,
};

// Re-export error types
pub use crate::error::{EventError, LedgerError, StoreError, Violation, ViolationKind};

// Re-export configuration
pub use crate::config::{AbuseConfig, BusConfig, LedgerConfig, MultiplierConfig};

// Re-export the event model and bus
pub use crate::bus::{
    BusHealth, BusStatistics, BusStatus, EventBus, EventDistributor, EventHandler, EventLog,
    MemoryEventLog,
};
pub use crate::event::{Event, EventType, MAX_EVENT_PAYLOAD_BYTES};

// Re-export the validator and multiplier calculator
pub use crate::antiabuse::AntiAbuseValidator;
pub use crate::multiplier::MultiplierCalculator;

// Re-export the persistence boundary
pub use crate::store::{LedgerStore, LedgerTx, MemoryStore};

// Re-export ledger types (primary entry point)
pub use crate::ledger::{Ledger, PointsLedger};

// Re-export commonly used external types
pub use async_trait::async_trait;
