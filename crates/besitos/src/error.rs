//! Error taxonomy for the ledger and event bus.
//!
//! Four distinct failure classes, per the ledger's contract:
//!
//! - [`Violation`] — anti-abuse rejection. Non-fatal: surfaced inside a
//!   failed [`AwardResult`](crate::AwardResult), balance untouched.
//! - [`StoreError`] — persistence failure. The [`Conflict`](StoreError::Conflict)
//!   variant is the retryable class; everything else is terminal.
//! - [`LedgerError::Constraint`] — the operation would violate a ledger
//!   invariant and is rejected before any mutation is attempted.
//! - [`EventError`] — an event failed construction-time validation. Raised
//!   synchronously to the code building the event; it never enters the bus.

use thiserror::Error;

/// Why the anti-abuse validator rejected an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Sliding-window rate ceiling exceeded for this action type.
    RateLimit,
    /// Recent contexts for this action type are exact duplicates beyond
    /// tolerance (suspected scripted replay).
    DuplicatePattern,
    /// The user is inside an escalation suppression window.
    Suppressed,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::RateLimit => "rate_limit",
            ViolationKind::DuplicatePattern => "duplicate_pattern",
            ViolationKind::Suppressed => "suppressed",
        }
    }
}

/// A structured anti-abuse rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Persistence-boundary failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient conflict (serialization failure, lock timeout). The ledger
    /// retries these with the per-user lock released between attempts.
    #[error("transient store conflict: {0}")]
    Conflict(String),

    /// Terminal backend failure. Not retried.
    #[error("store backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    /// True for the retryable class of failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend(err.into())
    }
}

/// Ledger operation failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("anti-abuse violation: {0}")]
    Validation(Violation),

    /// The operation would break a ledger invariant; nothing was mutated.
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Transient conflicts persisted through every retry attempt.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The caller-supplied deadline elapsed mid-operation. Rollback has
    /// already completed; the ledger is in the pre-call state.
    #[error("operation deadline elapsed")]
    DeadlineElapsed,
}

/// Construction-time event validation failure.
#[derive(Debug, Error)]
pub enum EventError {
    /// The type string is not `namespace.action` with exactly one dot,
    /// no whitespace, and a non-empty part on each side.
    #[error("invalid event type `{0}`: expected `namespace.action`")]
    InvalidType(String),

    #[error("event payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("event payload is not serializable: {0}")]
    Serialization(#[from] serde_json::Error),
}
