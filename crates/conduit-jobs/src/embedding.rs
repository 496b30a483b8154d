//! Embedding stage: persisted entity -> vector, and job finalization on the
//! job-terminal message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, instrument, warn};

use conduit_core::defaults::{
    EMBED_DIMENSION, EMBED_MAX_CHARS, EMBED_MODEL, EMBED_TIMEOUT_SECS, OLLAMA_EMBED_DIMENSION,
    OLLAMA_URL,
};
use conduit_core::{
    EmbeddingBackend, EntityStore, Envelope, Error, PipelineMessage, Result, Stage, Vector,
    VectorStore,
};

use crate::handler::{HandlerResult, MessageContext, StageHandler};
use crate::tracker::JobStatusTracker;

const TEXT_FIELDS: [&str; 5] = ["title", "name", "summary", "body", "description"];

/// Text to embed for an entity: the first present text fields in priority
/// order, else the compact JSON. Truncated to `max_chars` characters.
pub fn embedding_text(fields: &JsonValue, max_chars: usize) -> String {
    let parts: Vec<&str> = TEXT_FIELDS
        .iter()
        .filter_map(|f| fields.get(*f).and_then(JsonValue::as_str))
        .filter(|s| !s.trim().is_empty())
        .collect();
    let text = if parts.is_empty() {
        fields.to_string()
    } else {
        parts.join("\n")
    };
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

// =============================================================================
// BACKENDS
// =============================================================================

/// Deterministic local embedder: hashed bag of words, L2-normalized. Used
/// when no embedding provider is configured.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn fnv1a(token: &str) -> u64 {
        token.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = Self::fnv1a(&token.to_lowercase());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBED_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        Ok(texts
            .iter()
            .map(|t| Vector::from(self.embed_one(t)))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashing-bow"
    }
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding provider backed by Ollama's `/api/embed`.
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimension,
            timeout: Duration::from_secs(EMBED_TIMEOUT_SECS),
        }
    }

    /// `OLLAMA_BASE`, `OLLAMA_EMBED_MODEL`, `OLLAMA_EMBED_DIM`,
    /// `EMBED_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("OLLAMA_BASE").unwrap_or_else(|_| OLLAMA_URL.to_string());
        let model = std::env::var("OLLAMA_EMBED_MODEL").unwrap_or_else(|_| EMBED_MODEL.to_string());
        let dimension = std::env::var("OLLAMA_EMBED_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(OLLAMA_EMBED_DIMENSION);
        let timeout = std::env::var("EMBED_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(EMBED_TIMEOUT_SECS);
        info!(
            subsystem = "jobs",
            component = "embedding",
            url = %base_url,
            model = %model,
            dimension,
            "Using Ollama embedding provider"
        );
        Self::new(base_url, model, dimension).with_timeout(Duration::from_secs(timeout))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    #[instrument(skip(self, texts), fields(subsystem = "jobs", component = "embedding", op = "embed_texts", model = %self.model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let start = Instant::now();
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(self.timeout)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::Timeout(format!("embedding request failed: {}", e))
                } else {
                    Error::Embedding(format!("embedding request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(body),
                s if s.is_server_error() => Error::Timeout(format!("provider returned {}: {}", s, body)),
                s => Error::Embedding(format!("provider returned {}: {}", s, body)),
            });
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("failed to parse response: {}", e)))?;
        debug!(
            result_count = parsed.embeddings.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Embedding complete"
        );
        Ok(parsed.embeddings.into_iter().map(Vector::from).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// WORKER
// =============================================================================

pub struct EmbeddingWorker {
    entities: Arc<dyn EntityStore>,
    vectors: Arc<dyn VectorStore>,
    backend: Arc<dyn EmbeddingBackend>,
    tracker: JobStatusTracker,
    max_chars: usize,
}

impl EmbeddingWorker {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        vectors: Arc<dyn VectorStore>,
        backend: Arc<dyn EmbeddingBackend>,
        tracker: JobStatusTracker,
    ) -> Self {
        Self {
            entities,
            vectors,
            backend,
            tracker,
            max_chars: EMBED_MAX_CHARS,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    async fn embed_entity(&self, message: &PipelineMessage) -> Result<()> {
        let Some(entity_ref) = &message.entity_ref else {
            return Ok(());
        };
        let entity = self
            .entities
            .get(entity_ref.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entity {}", entity_ref.id)))?;

        let text = embedding_text(&entity.fields, self.max_chars);
        let vector = self
            .backend
            .embed_texts(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("provider returned no vector".into()))?;

        self.vectors
            .upsert(
                &entity.entity_type,
                &entity.natural_key,
                vector,
                json!({
                    "entity_id": entity.id,
                    "job_id": message.job_id,
                    "model": self.backend.model_name(),
                }),
            )
            .await
    }

    #[instrument(
        skip(self, message),
        fields(
            subsystem = "jobs",
            component = "embedding",
            op = "process",
            job_id = %message.job_id,
            step = %message.step
        )
    )]
    async fn process(&self, message: &PipelineMessage) -> HandlerResult {
        let (job_id, run_id, step, flags) = (
            message.job_id,
            message.run_id,
            message.step.as_str(),
            message.flags,
        );

        match self.tracker.is_current_run(job_id, run_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(%run_id, "Dropping message from a superseded run");
                return HandlerResult::Ack;
            }
            Err(e) => return HandlerResult::Retry(e.to_string()),
        }

        if let Err(e) = self
            .tracker
            .on_message_start(job_id, run_id, step, Stage::Embedding, flags)
            .await
        {
            return HandlerResult::Retry(e.to_string());
        }

        match self.embed_entity(message).await {
            Ok(()) => {}
            Err(e @ Error::NotFound(_)) => return HandlerResult::Retry(e.to_string()),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Transient embedding error");
                return HandlerResult::Retry(e.to_string());
            }
            Err(e) => return self.fail(message, &e.to_string()).await,
        }

        if let Err(e) = self
            .tracker
            .on_message_end(job_id, run_id, step, Stage::Embedding, flags)
            .await
        {
            return HandlerResult::Retry(e.to_string());
        }

        if flags.is_job_terminal() {
            if let Err(e) = self.tracker.finalize(job_id, run_id).await {
                return HandlerResult::Retry(e.to_string());
            }
        }
        HandlerResult::Ack
    }

    async fn fail(&self, message: &PipelineMessage, reason: &str) -> HandlerResult {
        error!(
            subsystem = "jobs",
            component = "embedding",
            job_id = %message.job_id,
            step = %message.step,
            error = reason,
            "Embedding failed"
        );
        match self
            .tracker
            .fail_step(
                message.job_id,
                message.run_id,
                &message.step,
                Stage::Embedding,
                reason,
            )
            .await
        {
            Ok(_) => HandlerResult::Failed(reason.to_string()),
            Err(e) => HandlerResult::Retry(e.to_string()),
        }
    }
}

#[async_trait]
impl StageHandler for EmbeddingWorker {
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    async fn handle(&self, ctx: &MessageContext) -> HandlerResult {
        match ctx.envelope() {
            Envelope::Embed(message) => self.process(message).await,
            other => HandlerResult::Failed(format!(
                "unexpected {} envelope on {}",
                other.stage(),
                ctx.queue()
            )),
        }
    }

    async fn abandon(&self, ctx: &MessageContext, reason: &str) {
        if let Envelope::Embed(message) = ctx.envelope() {
            if let HandlerResult::Retry(e) = self.fail(message, reason).await {
                error!(
                    subsystem = "jobs",
                    component = "embedding",
                    job_id = %message.job_id,
                    error = %e,
                    "Could not record abandoned embedding message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{
        Delivery, EventBus, Job, JobRepository, MappedEntity, MessageFlags, OverallStatus,
        QueueId, ServerEvent, StageStatus, Tenant, Tier,
    };
    use conduit_db::{InMemoryEntityStore, InMemoryJobRepository, InMemoryVectorStore};
    use uuid::Uuid;

    #[test]
    fn test_embedding_text_prefers_text_fields() {
        let fields = json!({"number": 3, "title": "Fix race", "body": "Adds a lock"});
        assert_eq!(embedding_text(&fields, 100), "Fix race\nAdds a lock");
        assert_eq!(embedding_text(&json!({"sha": "a1"}), 100), r#"{"sha":"a1"}"#);
        assert_eq!(embedding_text(&json!({"name": "héllo"}), 2), "hé");
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(16);
        let texts = vec!["pull request review".to_string(), "Pull Request Review".to_string()];
        let out = embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_slice(), out[1].as_slice());
        let norm: f32 = out[0].as_slice().iter().map(|x| x * x).sum();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(embedder.dimension(), 16);
    }

    struct Harness {
        worker: EmbeddingWorker,
        entities: Arc<InMemoryEntityStore>,
        vectors: Arc<InMemoryVectorStore>,
        tracker: JobStatusTracker,
        job: Job,
    }

    async fn harness() -> Harness {
        let jobs: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
        let tracker = JobStatusTracker::new(jobs.clone(), Arc::new(EventBus::new(64)));
        let entities = Arc::new(InMemoryEntityStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let job = Job::new(
            &Tenant::new(Uuid::new_v4(), Tier::Premium),
            Uuid::new_v4(),
            "github",
            crate::plan::PipelinePlan::github().status_document(),
            3600,
        );
        jobs.insert(&job).await.unwrap();
        let job = tracker.start_run(job.id).await.unwrap();
        let worker = EmbeddingWorker::new(
            entities.clone(),
            vectors.clone(),
            Arc::new(HashingEmbedder::default()),
            tracker.clone(),
        );
        Harness {
            worker,
            entities,
            vectors,
            tracker,
            job,
        }
    }

    fn ctx(job: &Job, entity_ref: Option<conduit_core::EntityRef>, flags: MessageFlags) -> MessageContext {
        MessageContext::new(
            Delivery {
                id: Uuid::new_v4(),
                queue: QueueId::route(Tier::Premium, Stage::Embedding),
                envelope: Envelope::Embed(PipelineMessage {
                    job_id: job.id,
                    run_id: job.run_id.unwrap(),
                    tenant_id: job.tenant_id,
                    tier: job.tier,
                    step: "github_prs_commits_reviews_comments".into(),
                    record_type: "pull_requests".into(),
                    raw_data_id: entity_ref.as_ref().map(|_| Uuid::new_v4()),
                    nested_type: None,
                    entity_ref,
                    flags,
                }),
                attempts: 1,
            },
            0,
        )
    }

    #[tokio::test]
    async fn test_vector_upserted_under_entity_type() {
        let h = harness().await;
        let entity = h
            .entities
            .upsert(&MappedEntity {
                entity_type: "pull_requests".into(),
                natural_key: "acme/api#1".into(),
                fields: json!({"title": "Fix race"}),
            })
            .await
            .unwrap();

        let result = h
            .worker
            .handle(&ctx(&h.job, Some(entity.reference()), MessageFlags::NONE))
            .await;
        assert_eq!(result, HandlerResult::Ack);

        let vector = h.vectors.get("pull_requests", "acme/api#1").await.unwrap().unwrap();
        assert_eq!(vector.as_slice().len(), EMBED_DIMENSION);
    }

    #[tokio::test]
    async fn test_job_terminal_message_finalizes_once() {
        let h = harness().await;
        let mut rx = h.tracker.events().subscribe();
        let flags = MessageFlags::new(true, true, true);

        for _ in 0..2 {
            let result = h.worker.handle(&ctx(&h.job, None, flags)).await;
            assert_eq!(result, HandlerResult::Ack);
        }

        let job = h.tracker.load(h.job.id).await.unwrap();
        assert_eq!(job.status.overall, OverallStatus::Finished);
        assert_eq!(
            job.status
                .step("github_prs_commits_reviews_comments")
                .unwrap()
                .embedding,
            StageStatus::Finished
        );
        let finalized = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e.payload, ServerEvent::JobFinalized { .. }))
            .count();
        assert_eq!(finalized, 1);
    }

    #[tokio::test]
    async fn test_step_terminal_without_job_flag_does_not_finalize() {
        let h = harness().await;
        let result = h
            .worker
            .handle(&ctx(&h.job, None, MessageFlags::new(true, true, false)))
            .await;
        assert_eq!(result, HandlerResult::Ack);
        assert_eq!(
            h.tracker.load(h.job.id).await.unwrap().status.overall,
            OverallStatus::Running
        );
    }

    #[tokio::test]
    async fn test_missing_entity_is_retried() {
        let h = harness().await;
        let missing = conduit_core::EntityRef {
            entity_type: "pull_requests".into(),
            id: Uuid::new_v4(),
            natural_key: "x".into(),
        };
        let result = h.worker.handle(&ctx(&h.job, Some(missing), MessageFlags::NONE)).await;
        assert!(matches!(result, HandlerResult::Retry(_)));
    }

    #[tokio::test]
    async fn test_terminal_from_superseded_run_does_not_finalize() {
        let h = harness().await;
        let mut stale = h.job.clone();
        stale.run_id = Some(Uuid::new_v4());

        let result = h
            .worker
            .handle(&ctx(&stale, None, MessageFlags::new(true, true, true)))
            .await;
        assert_eq!(result, HandlerResult::Ack);

        let job = h.tracker.load(h.job.id).await.unwrap();
        assert_eq!(job.status.overall, OverallStatus::Running);
        assert_eq!(
            job.status
                .step("github_prs_commits_reviews_comments")
                .unwrap()
                .embedding,
            StageStatus::Idle
        );
    }
}
