//! Durable event streams with consumer-group delivery.
//!
//! One stream per event kind, a per-stream monotonic sequence, and
//! at-least-once delivery: a message stays pending until its consumer group
//! acknowledges it, redelivers on failure, and moves to a dead-letter stream
//! after the redelivery limit. Co-located observers can additionally tap a
//! synchronous broadcast fast-path; the durable path stays authoritative.

pub mod store;

use async_trait::async_trait;
use montage_types::{CoreResult, Event};
use std::time::Duration;

pub use store::{DeadLetter, EventStore, PendingInfo};

/// A consumer-group member. The `name` is the group: every subscriber with
/// the same name shares one cursor and splits the load; distinct names each
/// see every message.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one delivery. `Ok` acknowledges the message; `Err` leaves it
    /// pending for redelivery. Implementations must be idempotent keyed by
    /// `event.id`.
    async fn handle_event(&self, event: &Event) -> CoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Redeliveries before a message moves to the dead-letter stream.
    pub redelivery_limit: u32,
    /// Pump wake interval when no publish notification arrives.
    pub poll_interval: Duration,
    /// Minimum age of an unacked delivery before it is retried.
    pub redelivery_delay: Duration,
    /// Cap on `causation_chain` length.
    pub max_chain_depth: usize,
    /// Deliveries claimed per pump iteration per stream.
    pub claim_batch: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            redelivery_limit: 3,
            poll_interval: Duration::from_millis(200),
            redelivery_delay: Duration::from_millis(200),
            max_chain_depth: 100,
            claim_batch: 32,
        }
    }
}

/// Convenience: subscribe a closure-backed consumer in tests and small tools.
pub struct FnSubscriber<F> {
    name: String,
    handler: F,
}

impl<F, Fut> FnSubscriber<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = CoreResult<()>> + Send,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> EventSubscriber for FnSubscriber<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = CoreResult<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_event(&self, event: &Event) -> CoreResult<()> {
        (self.handler)(event.clone()).await
    }
}
