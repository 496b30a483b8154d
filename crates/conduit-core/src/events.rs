//! Server event types, envelope schema, and event bus for status notifications.
//!
//! Every sub-status transition, job lifecycle change, and pool lifecycle change
//! is published on a single broadcast channel. Downstream consumers (the SSE
//! stream, the completion monitor) subscribe independently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{JobStatusDocument, Stage, Tier};

// ============================================================================
// Event Envelope
// ============================================================================

/// Optional emission context.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Overrides the tenant taken from the event payload.
    pub tenant_id: Option<Uuid>,
    /// Correlation ID for tracing related events across operations.
    pub correlation_id: Option<Uuid>,
}

/// Versioned event envelope.
///
/// The `event_type` field uses dot-namespaced names (e.g. `"job.status_changed"`,
/// `"pool.started"`). The `payload` carries the domain-specific event data.
///
/// ```text
/// event: job.status_changed
/// id: 019508a0-1234-7def-8000-abcdef123456
/// data: {"event_id":"...","event_type":"job.status_changed","occurred_at":"...","payload":{...}}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    /// Type of entity this event relates to (`"job"` or `"pool"`).
    pub entity_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: ServerEvent,
}

impl EventEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self::with_context(event, EventContext::default())
    }

    pub fn with_context(event: ServerEvent, ctx: EventContext) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            tenant_id: ctx.tenant_id.or_else(|| event.tenant_id()),
            entity_type: event.entity_type(),
            entity_id: event.entity_id(),
            correlation_id: ctx.correlation_id,
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Server Event (domain payloads)
// ============================================================================

/// Domain events, serialized with a `type` tag field, e.g.
/// `{"type":"JobFinalized","job_id":"...","tenant_id":"..."}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A sub-status or the overall status of a job changed. Carries the full
    /// status document.
    JobStatusChanged {
        job_id: Uuid,
        tenant_id: Uuid,
        status: JobStatusDocument,
    },
    /// A job run began (READY to RUNNING).
    JobStarted {
        job_id: Uuid,
        tenant_id: Uuid,
        source: String,
    },
    /// The job-terminal message finished embedding (RUNNING to FINISHED).
    JobFinalized { job_id: Uuid, tenant_id: Uuid },
    /// A step failed permanently and the job moved to FAILED.
    JobFailed {
        job_id: Uuid,
        tenant_id: Uuid,
        step: String,
        stage: Stage,
        error: String,
    },
    /// Job returned to READY with all sub-statuses idle.
    JobReset {
        job_id: Uuid,
        tenant_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_run_at: Option<DateTime<Utc>>,
    },
    /// Completion backoff exhausted without the job reaching complete.
    CompletionStalled {
        job_id: Uuid,
        tenant_id: Uuid,
        attempts: u32,
    },
    PoolStarted {
        tier: Tier,
        stage: Stage,
        workers: usize,
    },
    PoolStopped { tier: Tier, stage: Stage },
    /// A worker slot crashed and was replaced.
    WorkerRespawned {
        tier: Tier,
        stage: Stage,
        slot: usize,
        restarts: u32,
    },
    /// A worker slot exceeded its restart budget and is no longer replaced.
    WorkerSlotDisabled {
        tier: Tier,
        stage: Stage,
        slot: usize,
    },
}

impl ServerEvent {
    /// Short event name (used for SSE filtering).
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::JobStatusChanged { .. } => "JobStatusChanged",
            ServerEvent::JobStarted { .. } => "JobStarted",
            ServerEvent::JobFinalized { .. } => "JobFinalized",
            ServerEvent::JobFailed { .. } => "JobFailed",
            ServerEvent::JobReset { .. } => "JobReset",
            ServerEvent::CompletionStalled { .. } => "CompletionStalled",
            ServerEvent::PoolStarted { .. } => "PoolStarted",
            ServerEvent::PoolStopped { .. } => "PoolStopped",
            ServerEvent::WorkerRespawned { .. } => "WorkerRespawned",
            ServerEvent::WorkerSlotDisabled { .. } => "WorkerSlotDisabled",
        }
    }

    /// Namespaced event type for the envelope.
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            ServerEvent::JobStatusChanged { .. } => "job.status_changed",
            ServerEvent::JobStarted { .. } => "job.started",
            ServerEvent::JobFinalized { .. } => "job.finalized",
            ServerEvent::JobFailed { .. } => "job.failed",
            ServerEvent::JobReset { .. } => "job.reset",
            ServerEvent::CompletionStalled { .. } => "job.completion_stalled",
            ServerEvent::PoolStarted { .. } => "pool.started",
            ServerEvent::PoolStopped { .. } => "pool.stopped",
            ServerEvent::WorkerRespawned { .. } => "pool.worker_respawned",
            ServerEvent::WorkerSlotDisabled { .. } => "pool.worker_disabled",
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            ServerEvent::PoolStarted { .. }
            | ServerEvent::PoolStopped { .. }
            | ServerEvent::WorkerRespawned { .. }
            | ServerEvent::WorkerSlotDisabled { .. } => "pool",
            _ => "job",
        }
    }

    /// Job ID, or `tier/stage` for pool events.
    pub fn entity_id(&self) -> Option<String> {
        match self {
            ServerEvent::PoolStarted { tier, stage, .. }
            | ServerEvent::PoolStopped { tier, stage }
            | ServerEvent::WorkerRespawned { tier, stage, .. }
            | ServerEvent::WorkerSlotDisabled { tier, stage, .. } => {
                Some(format!("{}/{}", tier, stage))
            }
            _ => self.job_id().map(|id| id.to_string()),
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            ServerEvent::JobStatusChanged { job_id, .. }
            | ServerEvent::JobStarted { job_id, .. }
            | ServerEvent::JobFinalized { job_id, .. }
            | ServerEvent::JobFailed { job_id, .. }
            | ServerEvent::JobReset { job_id, .. }
            | ServerEvent::CompletionStalled { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            ServerEvent::JobStatusChanged { tenant_id, .. }
            | ServerEvent::JobStarted { tenant_id, .. }
            | ServerEvent::JobFinalized { tenant_id, .. }
            | ServerEvent::JobFailed { tenant_id, .. }
            | ServerEvent::JobReset { tenant_id, .. }
            | ServerEvent::CompletionStalled { tenant_id, .. } => Some(*tenant_id),
            _ => None,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus.
///
/// Slow receivers that fall behind get a `Lagged` error and miss events.
/// Consumers that must not miss a transition (the completion monitor) pair
/// their subscription with a periodic sweep of persisted state.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently without subscribers.
    pub fn emit(&self, event: ServerEvent) {
        self.send(EventEnvelope::new(event));
    }

    pub fn emit_with_context(&self, event: ServerEvent, ctx: EventContext) {
        self.send(EventEnvelope::with_context(event, ctx));
    }

    fn send(&self, envelope: EventEnvelope) {
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();

        bus.emit(ServerEvent::JobFinalized { job_id, tenant_id });

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.payload, ServerEvent::JobFinalized { .. }));
        assert_eq!(envelope.event_type, "job.finalized");
        assert_eq!(envelope.payload_version, 1);
        assert_eq!(envelope.tenant_id, Some(tenant_id));
        assert_eq!(envelope.entity_type, "job");
        assert_eq!(envelope.entity_id, Some(job_id.to_string()));
    }

    #[tokio::test]
    async fn test_pool_event_entity() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();

        bus.emit(ServerEvent::PoolStarted {
            tier: Tier::Premium,
            stage: Stage::Transform,
            workers: 5,
        });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.entity_type, "pool");
        assert_eq!(envelope.entity_id.as_deref(), Some("premium/transform"));
        assert!(envelope.tenant_id.is_none());
    }

    #[tokio::test]
    async fn test_context_overrides_tenant() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let override_tenant = Uuid::new_v4();
        let correlation = Uuid::new_v4();

        bus.emit_with_context(
            ServerEvent::PoolStopped {
                tier: Tier::Free,
                stage: Stage::Embedding,
            },
            EventContext {
                tenant_id: Some(override_tenant),
                correlation_id: Some(correlation),
            },
        );

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.tenant_id, Some(override_tenant));
        assert_eq!(envelope.correlation_id, Some(correlation));
    }

    #[tokio::test]
    async fn test_event_bus_no_subscribers_ok() {
        let bus = EventBus::new(32);
        bus.emit(ServerEvent::PoolStopped {
            tier: Tier::Free,
            stage: Stage::Extraction,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_server_event_json() {
        let event = ServerEvent::JobFailed {
            job_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            step: "github_repositories".to_string(),
            stage: Stage::Extraction,
            error: "Unauthorized: bad token".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobFailed");
        assert_eq!(json["stage"], "extraction");
        assert_eq!(event.event_type(), "JobFailed");

        let reset = ServerEvent::JobReset {
            job_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            next_run_at: None,
        };
        let json = serde_json::to_string(&reset).unwrap();
        assert!(!json.contains("next_run_at"));
    }

    #[test]
    fn test_status_changed_carries_document() {
        let status = JobStatusDocument::new()
            .with_step("s1", crate::models::StepState::new(1, "Step One"));
        let event = ServerEvent::JobStatusChanged {
            job_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            status,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"]["overall"], "READY");
        assert_eq!(json["status"]["steps"]["s1"]["extraction"], "idle");
    }
}
