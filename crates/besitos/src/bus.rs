//! Publish/subscribe distribution with wildcard routing, bounded replay, and
//! failure isolation.
//!
//! Delivery contract:
//!
//! - A handler failure is caught, logged, and counted. It never propagates to
//!   the publisher and never prevents delivery to the remaining handlers for
//!   the same event.
//! - Replay is **at-least-once**: handlers may see an event again and must
//!   tolerate duplicates. The bus does not assume handlers are stateless.
//! - The subscription table has its own lock, decoupled from every ledger
//!   lock, so a slow subscriber cannot block a ledger mutation.

use crate::config::BusConfig;
use crate::error::EventError;
use crate::event::{Event, EventType};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// A named event consumer. The name is the handler's identity for
/// unsubscribe and replay targeting, so it should be stable and unique per
/// logical subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

type HandlerRef = Arc<dyn EventHandler>;

/// The distribution capability set: publish, subscribe, unsubscribe,
/// replay, health. [`EventBus`] is the reference implementation; the
/// ledger publishes through this seam.
#[async_trait]
pub trait EventDistributor: Send + Sync {
    /// Register a handler for an exact event type or a `namespace.*`
    /// wildcard. Idempotent: re-subscribing the same handler name to the
    /// same pattern replaces the previous registration.
    fn subscribe(&self, pattern: &str, handler: HandlerRef) -> Result<(), EventError>;

    /// Remove a handler by name. Unsubscribing an absent handler is a no-op.
    fn unsubscribe(&self, pattern: &str, handler_name: &str);

    /// Deliver an event to every matching handler, then retain it.
    /// Returns the number of handlers invoked.
    async fn publish(&self, event: Event) -> Result<usize>;

    /// Retained events, newest first, up to `limit`.
    async fn get_published_events(
        &self,
        limit: usize,
        types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>>;

    /// Re-deliver retained events in original timestamp order,
    /// at-least-once. `target_handlers` narrows delivery to the named
    /// handlers; `None` means every currently matching handler.
    async fn replay_events(
        &self,
        types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
        target_handlers: Option<&[&str]>,
    ) -> Result<usize>;

    /// Coarse status plus subscriber and event counters.
    async fn health_check(&self) -> Result<BusHealth>;

    /// Incrementally maintained aggregates.
    fn get_statistics(&self) -> BusStatistics;
}

/// Bounded retention of published events, independent of live subscription
/// state. In-memory reference implementation below; a Postgres-backed one
/// lives in `besitos-store-postgres`.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: Event) -> Result<()>;

    /// Events in original publish order, oldest first, filtered by exact
    /// type and/or timestamp.
    async fn fetch(
        &self,
        types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>>;

    async fn retained(&self) -> Result<usize>;
}

/// Size-bounded in-memory ring of published events.
pub struct MemoryEventLog {
    events: Mutex<VecDeque<Event>>,
    max_retained: usize,
}

impl MemoryEventLog {
    pub fn new(max_retained: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_retained,
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let mut events = self.events.lock().expect("event log poisoned");
        events.push_back(event);
        while events.len() > self.max_retained {
            events.pop_front();
        }
        Ok(())
    }

    async fn fetch(
        &self,
        types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let events = self.events.lock().expect("event log poisoned");
        Ok(events
            .iter()
            .filter(|e| types.is_none_or(|ts| ts.contains(&e.event_type)))
            .filter(|e| since.is_none_or(|s| e.timestamp >= s))
            .cloned()
            .collect())
    }

    async fn retained(&self) -> Result<usize> {
        Ok(self.events.lock().expect("event log poisoned").len())
    }
}

/// Coarse bus status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Healthy,
    /// Handler failure ratio crossed the configured threshold.
    Degraded,
}

/// Snapshot returned by [`EventBus::health_check`].
#[derive(Debug, Clone)]
pub struct BusHealth {
    pub status: BusStatus,
    pub patterns: usize,
    pub handlers: usize,
    pub retained_events: usize,
    pub events_published: u64,
    pub handler_failures: u64,
}

/// Running aggregates, maintained incrementally on every publish — never by
/// scanning retained history.
#[derive(Debug, Clone, Default)]
pub struct BusStatistics {
    pub events_published: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
    pub events_replayed: u64,
    pub avg_publish_micros: f64,
    pub avg_handler_micros: f64,
}

#[derive(Default)]
struct StatsInner {
    events_published: u64,
    handler_invocations: u64,
    handler_failures: u64,
    events_replayed: u64,
    avg_publish_micros: f64,
    avg_handler_micros: f64,
}

impl StatsInner {
    // Welford-style running mean: avg += (x - avg) / n.
    fn record_publish(&mut self, micros: f64) {
        self.events_published += 1;
        self.avg_publish_micros +=
            (micros - self.avg_publish_micros) / self.events_published as f64;
    }

    fn record_handler(&mut self, micros: f64, failed: bool) {
        self.handler_invocations += 1;
        if failed {
            self.handler_failures += 1;
        }
        self.avg_handler_micros +=
            (micros - self.avg_handler_micros) / self.handler_invocations as f64;
    }
}

/// Publish/subscribe event distribution with bounded replay.
pub struct EventBus {
    subscriptions: DashMap<String, SmallVec<[HandlerRef; 2]>>,
    log: Arc<dyn EventLog>,
    stats: Mutex<StatsInner>,
    handler_failures: AtomicU64,
    config: BusConfig,
}

impl EventBus {
    /// Bus with in-memory retention sized from the config.
    pub fn new(config: BusConfig) -> Self {
        let log = Arc::new(MemoryEventLog::new(config.max_retained));
        Self::with_log(config, log)
    }

    /// Bus over a caller-supplied retention log.
    pub fn with_log(config: BusConfig, log: Arc<dyn EventLog>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            log,
            stats: Mutex::new(StatsInner::default()),
            handler_failures: AtomicU64::new(0),
            config,
        }
    }

    fn matching_handlers(
        &self,
        event_type: &str,
        target_handlers: Option<&[&str]>,
    ) -> Vec<HandlerRef> {
        let mut handlers: Vec<HandlerRef> = Vec::new();
        for entry in self.subscriptions.iter() {
            if !pattern_matches(entry.key(), event_type) {
                continue;
            }
            for handler in entry.value() {
                let targeted =
                    target_handlers.is_none_or(|names| names.contains(&handler.name()));
                let seen = handlers.iter().any(|h| h.name() == handler.name());
                if targeted && !seen {
                    handlers.push(handler.clone());
                }
            }
        }
        handlers
    }

    async fn invoke_isolated(&self, handler: &HandlerRef, event: &Event) {
        let started = Instant::now();
        let outcome = handler.handle(event).await;
        let elapsed = started.elapsed().as_micros() as f64;

        let failed = outcome.is_err();
        if let Err(err) = outcome {
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                handler = handler.name(),
                event_type = %event.event_type,
                event_id = %event.id,
                error = %err,
                "event handler failed; continuing delivery"
            );
        }
        self.stats
            .lock()
            .expect("bus stats poisoned")
            .record_handler(elapsed, failed);
    }
}

#[async_trait]
impl EventDistributor for EventBus {
    fn subscribe(&self, pattern: &str, handler: HandlerRef) -> Result<(), EventError> {
        validate_pattern(pattern)?;
        let mut entry = self.subscriptions.entry(pattern.to_string()).or_default();
        if let Some(existing) = entry.iter_mut().find(|h| h.name() == handler.name()) {
            *existing = handler;
        } else {
            entry.push(handler);
        }
        Ok(())
    }

    // The pattern entry is dropped once its handler list empties.
    fn unsubscribe(&self, pattern: &str, handler_name: &str) {
        if let Some(mut entry) = self.subscriptions.get_mut(pattern) {
            entry.retain(|h| h.name() != handler_name);
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.subscriptions
                    .remove_if(pattern, |_, handlers| handlers.is_empty());
            }
        }
    }

    async fn publish(&self, event: Event) -> Result<usize> {
        let started = Instant::now();
        let handlers = self.matching_handlers(event.event_type.as_str(), None);

        let mut invoked = 0;
        for handler in &handlers {
            self.invoke_isolated(handler, &event).await;
            invoked += 1;
        }

        self.log.append(event.clone()).await?;

        let elapsed = started.elapsed().as_micros() as f64;
        self.stats
            .lock()
            .expect("bus stats poisoned")
            .record_publish(elapsed);

        debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            handlers = invoked,
            "event published"
        );
        Ok(invoked)
    }

    async fn get_published_events(
        &self,
        limit: usize,
        types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let mut events = self.log.fetch(types, since).await?;
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn replay_events(
        &self,
        types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
        target_handlers: Option<&[&str]>,
    ) -> Result<usize> {
        let mut events = self.log.fetch(types, since).await?;
        events.sort_by_key(|e| e.timestamp);

        let mut delivered = 0;
        for event in &events {
            let handlers = self.matching_handlers(event.event_type.as_str(), target_handlers);
            for handler in &handlers {
                self.invoke_isolated(handler, event).await;
                delivered += 1;
            }
        }

        self.stats.lock().expect("bus stats poisoned").events_replayed += events.len() as u64;
        debug!(events = events.len(), delivered, "replay complete");
        Ok(delivered)
    }

    async fn health_check(&self) -> Result<BusHealth> {
        let (events_published, handler_invocations) = {
            let stats = self.stats.lock().expect("bus stats poisoned");
            (stats.events_published, stats.handler_invocations)
        };
        let handler_failures = self.handler_failures.load(Ordering::Relaxed);

        let degraded = handler_invocations > 0
            && handler_failures * 1000
                > handler_invocations * self.config.degraded_failure_per_mille;

        let handlers = self.subscriptions.iter().map(|e| e.value().len()).sum();

        Ok(BusHealth {
            status: if degraded {
                BusStatus::Degraded
            } else {
                BusStatus::Healthy
            },
            patterns: self.subscriptions.len(),
            handlers,
            retained_events: self.log.retained().await?,
            events_published,
            handler_failures,
        })
    }

    fn get_statistics(&self) -> BusStatistics {
        let stats = self.stats.lock().expect("bus stats poisoned");
        BusStatistics {
            events_published: stats.events_published,
            handler_invocations: stats.handler_invocations,
            handler_failures: stats.handler_failures,
            events_replayed: stats.events_replayed,
            avg_publish_micros: stats.avg_publish_micros,
            avg_handler_micros: stats.avg_handler_micros,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Exact match, or `namespace.*` matching any type in that namespace.
fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(ns) => event_type.split_once('.').is_some_and(|(ety_ns, _)| ety_ns == ns),
        None => pattern == event_type,
    }
}

fn validate_pattern(pattern: &str) -> Result<(), EventError> {
    if let Some(ns) = pattern.strip_suffix(".*") {
        if !ns.is_empty() && !ns.contains('.') && !ns.chars().any(char::is_whitespace) {
            return Ok(());
        }
        return Err(EventError::InvalidType(pattern.to_string()));
    }
    EventType::new(pattern).map(|_| ())
}
