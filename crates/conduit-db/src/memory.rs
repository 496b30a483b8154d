//! In-memory implementations of every store and the queue broker.
//!
//! Used when `DATABASE_URL` is unset and throughout the test suites. They
//! honor the same contracts as the Postgres adapters: natural-key upserts,
//! serialized job mutation, and at-least-once delivery with explicit ack.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use conduit_core::{
    Delivery, Entity, EntityStore, Envelope, Error, Job, JobMutation, JobRepository, JobUpdate,
    MappedEntity, OverallStatus, QueueBroker, QueueDepth, QueueId, RawRecord, RawRecordStore,
    Result, Vector, VectorStore,
};

use crate::records::entity_id;

// =============================================================================
// JOBS
// =============================================================================

#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs
            .values()
            .any(|j| j.tenant_id == job.tenant_id && j.integration_id == job.integration_id)
        {
            return Err(Error::InvalidState(format!(
                "integration {} already has a job",
                job.integration_id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn modify(&self, job_id: Uuid, mutation: JobMutation) -> Result<JobUpdate> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;

        // Mutate a copy so a failed mutation leaves the stored job untouched.
        let mut job = stored.clone();
        let changed = mutation(&mut job)?;
        if changed {
            job.updated_at = Utc::now();
            *stored = job.clone();
        }
        Ok(JobUpdate { job, changed })
    }

    async fn list_by_status(&self, status: OverallStatus) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| j.status.overall == status)
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| j.status.overall == OverallStatus::Ready)
            .filter(|j| j.next_run_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.next_run_at);
        Ok(out)
    }

    async fn list(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<Job> = jobs.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}

// =============================================================================
// RAW RECORDS
// =============================================================================

#[derive(Default)]
pub struct InMemoryRawRecordStore {
    records: RwLock<HashMap<Uuid, RawRecord>>,
    index: RwLock<HashMap<(Uuid, String, String), Uuid>>,
}

impl InMemoryRawRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawRecordStore for InMemoryRawRecordStore {
    async fn put(
        &self,
        job_id: Uuid,
        record_type: &str,
        key: &str,
        payload: JsonValue,
    ) -> Result<Uuid> {
        let mut index = self.index.write().await;
        let mut records = self.records.write().await;
        let natural = (job_id, record_type.to_string(), key.to_string());

        if let Some(id) = index.get(&natural) {
            if let Some(existing) = records.get_mut(id) {
                existing.payload = payload;
            }
            return Ok(*id);
        }

        let id = Uuid::now_v7();
        records.insert(
            id,
            RawRecord {
                id,
                job_id,
                record_type: record_type.to_string(),
                key: key.to_string(),
                payload,
                created_at: Utc::now(),
            },
        );
        index.insert(natural, id);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<RawRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn count_for_job(&self, job_id: Uuid) -> Result<i64> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.job_id == job_id)
            .count() as i64)
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<Uuid, Entity>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn upsert(&self, entity: &MappedEntity) -> Result<Entity> {
        let id = entity_id(&entity.entity_type, &entity.natural_key);
        let stored = Entity {
            id,
            entity_type: entity.entity_type.clone(),
            natural_key: entity.natural_key.clone(),
            fields: entity.fields.clone(),
            updated_at: Utc::now(),
        };
        self.entities.write().await.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.entities.read().await.get(&id).cloned())
    }

    async fn get_by_key(&self, entity_type: &str, natural_key: &str) -> Result<Option<Entity>> {
        self.get(entity_id(entity_type, natural_key)).await
    }

    async fn count(&self, entity_type: Option<&str>) -> Result<i64> {
        Ok(self
            .entities
            .read()
            .await
            .values()
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .count() as i64)
    }
}

// =============================================================================
// VECTORS
// =============================================================================

#[derive(Default)]
pub struct InMemoryVectorStore {
    vectors: RwLock<HashMap<(String, String), (Vector, JsonValue)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        table: &str,
        external_id: &str,
        vector: Vector,
        metadata: JsonValue,
    ) -> Result<()> {
        self.vectors
            .write()
            .await
            .insert((table.to_string(), external_id.to_string()), (vector, metadata));
        Ok(())
    }

    async fn get(&self, table: &str, external_id: &str) -> Result<Option<Vector>> {
        Ok(self
            .vectors
            .read()
            .await
            .get(&(table.to_string(), external_id.to_string()))
            .map(|(v, _)| v.clone()))
    }

    async fn count(&self, table: Option<&str>) -> Result<i64> {
        Ok(self
            .vectors
            .read()
            .await
            .keys()
            .filter(|(t, _)| table.map_or(true, |want| t == want))
            .count() as i64)
    }
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Clone)]
struct StoredMessage {
    id: Uuid,
    envelope: Envelope,
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<Uuid, StoredMessage>,
}

/// FIFO broker holding all tier-scoped queues in process memory.
pub struct InMemoryQueueBroker {
    queues: Mutex<HashMap<QueueId, QueueState>>,
    notifiers: HashMap<QueueId, Arc<Notify>>,
}

impl Default for InMemoryQueueBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueBroker {
    pub fn new() -> Self {
        let all = QueueId::all();
        Self {
            queues: Mutex::new(all.iter().map(|q| (*q, QueueState::default())).collect()),
            notifiers: all.into_iter().map(|q| (q, Arc::new(Notify::new()))).collect(),
        }
    }

    /// Envelopes currently ready on `queue`, oldest first.
    pub async fn peek(&self, queue: QueueId) -> Vec<Envelope> {
        self.queues
            .lock()
            .await
            .get(&queue)
            .map(|s| s.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Return every in-flight message to the front of its queue.
    pub async fn requeue_in_flight(&self) -> usize {
        let mut queues = self.queues.lock().await;
        let mut moved = 0;
        for (queue, state) in queues.iter_mut() {
            let mut held: Vec<StoredMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
            if held.is_empty() {
                continue;
            }
            held.sort_by_key(|m| m.id);
            moved += held.len();
            for msg in held.into_iter().rev() {
                state.ready.push_front(msg);
            }
            self.notifier(*queue).notify_waiters();
        }
        moved
    }
}

#[async_trait]
impl QueueBroker for InMemoryQueueBroker {
    async fn publish(&self, queue: QueueId, envelope: Envelope) -> Result<Uuid> {
        let id = Uuid::now_v7();
        {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(&queue)
                .ok_or_else(|| Error::Queue(format!("unknown queue {}", queue)))?;
            state.ready.push_back(StoredMessage {
                id,
                envelope,
                attempts: 0,
            });
        }
        self.notifier(queue).notify_one();
        Ok(id)
    }

    async fn receive(&self, queue: QueueId) -> Result<Option<Delivery>> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&queue)
            .ok_or_else(|| Error::Queue(format!("unknown queue {}", queue)))?;
        let Some(mut msg) = state.ready.pop_front() else {
            return Ok(None);
        };
        msg.attempts += 1;
        let delivery = Delivery {
            id: msg.id,
            queue,
            envelope: msg.envelope.clone(),
            attempts: msg.attempts,
        };
        state.in_flight.insert(msg.id, msg);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(&delivery.queue) {
            state.in_flight.remove(&delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let requeued = {
            let mut queues = self.queues.lock().await;
            let Some(state) = queues.get_mut(&delivery.queue) else {
                return Ok(());
            };
            match state.in_flight.remove(&delivery.id) {
                Some(msg) if requeue => {
                    state.ready.push_front(msg);
                    true
                }
                _ => false,
            }
        };
        if requeued {
            self.notifier(delivery.queue).notify_one();
        }
        Ok(())
    }

    async fn depth(&self, queue: QueueId) -> Result<QueueDepth> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(&queue)
            .ok_or_else(|| Error::Queue(format!("unknown queue {}", queue)))?;
        Ok(QueueDepth {
            queue,
            ready: state.ready.len() as u64,
            in_flight: state.in_flight.len() as u64,
        })
    }

    fn notifier(&self, queue: QueueId) -> Arc<Notify> {
        self.notifiers
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }
}
