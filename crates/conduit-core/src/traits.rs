//! Core traits for conduit abstractions.
//!
//! These traits define the interfaces that the pipeline depends on: external
//! record sources, the stores behind each stage, job persistence, and the
//! queue broker. Postgres and in-memory implementations live in conduit-db.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// SOURCE TRAITS
// =============================================================================

/// External paginated record source (GitHub, Jira, ...).
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch one page. Transient failures should surface as
    /// [`crate::Error::Source`], [`crate::Error::RateLimited`] or
    /// [`crate::Error::Timeout`] so the caller retries them.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;

    /// Check if the source is reachable.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Human-readable name of this source.
    fn name(&self) -> &str;
}

// =============================================================================
// STORAGE TRAITS
// =============================================================================

/// Store for raw records persisted by extraction.
#[async_trait]
pub trait RawRecordStore: Send + Sync {
    /// Persist a raw record and return its id. Re-persisting the same
    /// (job, type, key) overwrites the payload and returns the same id.
    async fn put(
        &self,
        job_id: Uuid,
        record_type: &str,
        key: &str,
        payload: JsonValue,
    ) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Option<RawRecord>>;

    /// Number of raw records stored for a job.
    async fn count_for_job(&self, job_id: Uuid) -> Result<i64>;
}

/// Store for domain entities produced by the Transform stage.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or update by (entity_type, natural_key).
    async fn upsert(&self, entity: &MappedEntity) -> Result<Entity>;

    async fn get(&self, id: Uuid) -> Result<Option<Entity>>;

    async fn get_by_key(&self, entity_type: &str, natural_key: &str) -> Result<Option<Entity>>;

    async fn count(&self, entity_type: Option<&str>) -> Result<i64>;
}

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Returns one vector per input text.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<crate::Vector>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Store for entity vectors.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or update the vector keyed by (table, external_id).
    async fn upsert(
        &self,
        table: &str,
        external_id: &str,
        vector: crate::Vector,
        metadata: JsonValue,
    ) -> Result<()>;

    async fn get(&self, table: &str, external_id: &str) -> Result<Option<crate::Vector>>;

    async fn count(&self, table: Option<&str>) -> Result<i64>;
}

// =============================================================================
// JOB REPOSITORY TRAITS
// =============================================================================

/// Read-modify-write closure applied to a job under the repository's lock.
/// Returns whether the job changed; `Err` aborts without persisting.
pub type JobMutation = Box<dyn FnOnce(&mut Job) -> Result<bool> + Send>;

/// Outcome of [`JobRepository::modify`].
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job: Job,
    pub changed: bool,
}

/// Repository for job state.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job. Fails with [`crate::Error::InvalidState`] when the
    /// tenant already has a job for the integration.
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Apply `mutation` atomically. Concurrent calls for the same job are
    /// serialized, so compare-and-set transitions are safe.
    async fn modify(&self, job_id: Uuid, mutation: JobMutation) -> Result<JobUpdate>;

    /// Jobs in the given overall status.
    async fn list_by_status(&self, status: OverallStatus) -> Result<Vec<Job>>;

    /// READY jobs whose `next_run_at` is at or before `now`.
    async fn list_due(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<Job>>;

    async fn list(&self, limit: i64) -> Result<Vec<Job>>;
}

// =============================================================================
// QUEUE TRAITS
// =============================================================================

/// Durable at-least-once message broker holding the tier-scoped queues.
///
/// A received [`Delivery`] stays invisible to other consumers until it is
/// acked (removed) or nacked (requeued or dropped).
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn publish(&self, queue: QueueId, envelope: Envelope) -> Result<Uuid>;

    /// Take the oldest ready message, if any.
    async fn receive(&self, queue: QueueId) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    async fn depth(&self, queue: QueueId) -> Result<QueueDepth>;

    /// Signalled when a message is published to `queue`.
    fn notifier(&self, queue: QueueId) -> Arc<Notify>;
}
