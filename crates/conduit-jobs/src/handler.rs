//! Stage handlers consumed by the worker pools.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

use conduit_core::{Delivery, Envelope, QueueId, Stage};

/// Context provided to stage handlers.
pub struct MessageContext {
    /// The delivery being processed.
    pub delivery: Delivery,
    /// Index of the worker slot processing it.
    pub slot: usize,
}

impl MessageContext {
    pub fn new(delivery: Delivery, slot: usize) -> Self {
        Self { delivery, slot }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.delivery.envelope
    }

    /// Number of times this message has been delivered, including now.
    pub fn attempts(&self) -> u32 {
        self.delivery.attempts
    }

    pub fn queue(&self) -> QueueId {
        self.delivery.queue
    }
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResult {
    /// Processed; remove from the queue.
    Ack,
    /// Could not be processed and never will; remove from the queue.
    Failed(String),
    /// Transient failure; redeliver.
    Retry(String),
}

/// Trait for stage handlers.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage whose queues this handler consumes.
    fn stage(&self) -> Stage;

    /// Handle one delivery.
    async fn handle(&self, ctx: &MessageContext) -> HandlerResult;

    /// Called when a delivery is dropped after exhausting its redeliveries.
    async fn abandon(&self, _ctx: &MessageContext, _reason: &str) {}

    fn can_handle(&self, stage: Stage) -> bool {
        self.stage() == stage
    }
}

/// Handler that acks everything. Counts what it saw.
pub struct NoOpHandler {
    stage: Stage,
    handled: AtomicUsize,
}

impl NoOpHandler {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            handled: AtomicUsize::new(0),
        }
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageHandler for NoOpHandler {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn handle(&self, _ctx: &MessageContext) -> HandlerResult {
        self.handled.fetch_add(1, Ordering::SeqCst);
        HandlerResult::Ack
    }
}
