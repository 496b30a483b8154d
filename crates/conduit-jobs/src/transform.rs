//! Transform stage: raw record -> domain entity.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, trace};

use conduit_core::{
    EntityRef, EntityStore, Envelope, Error, PipelineMessage, RawRecordStore, Stage,
};

use crate::handler::{HandlerResult, MessageContext, StageHandler};
use crate::mapper::MapperRegistry;
use crate::router::QueueRouter;
use crate::tracker::JobStatusTracker;

pub struct TransformWorker {
    raw_records: Arc<dyn RawRecordStore>,
    entities: Arc<dyn EntityStore>,
    mappers: Arc<MapperRegistry>,
    router: QueueRouter,
    tracker: JobStatusTracker,
}

impl TransformWorker {
    pub fn new(
        raw_records: Arc<dyn RawRecordStore>,
        entities: Arc<dyn EntityStore>,
        mappers: Arc<MapperRegistry>,
        router: QueueRouter,
        tracker: JobStatusTracker,
    ) -> Self {
        Self {
            raw_records,
            entities,
            mappers,
            router,
            tracker,
        }
    }

    /// Load, map and upsert the referenced record. `None` for synthetic
    /// messages.
    async fn persist(&self, message: &PipelineMessage) -> Result<Option<EntityRef>, Error> {
        let Some(raw_data_id) = message.raw_data_id else {
            return Ok(None);
        };
        let raw = self
            .raw_records
            .get(raw_data_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("raw record {}", raw_data_id)))?;
        let mapped = self.mappers.map(&raw)?;
        let entity = self.entities.upsert(&mapped).await?;
        trace!(
            subsystem = "jobs",
            component = "transform",
            entity_type = %entity.entity_type,
            natural_key = %entity.natural_key,
            "Entity upserted"
        );
        Ok(Some(entity.reference()))
    }

    #[instrument(
        skip(self, message),
        fields(
            subsystem = "jobs",
            component = "transform",
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
            .on_message_start(job_id, run_id, step, Stage::Transform, flags)
            .await
        {
            return HandlerResult::Retry(e.to_string());
        }

        let entity_ref = match self.persist(message).await {
            Ok(r) => r,
            // Not yet visible to this reader; redelivery picks it up.
            Err(e @ Error::NotFound(_)) => return HandlerResult::Retry(e.to_string()),
            Err(e) if e.is_transient() => return HandlerResult::Retry(e.to_string()),
            Err(e) => return self.fail(message, &e.to_string()).await,
        };

        // Finish before forwarding so Embedding never overtakes this stage.
        if let Err(e) = self
            .tracker
            .on_message_end(job_id, run_id, step, Stage::Transform, flags)
            .await
        {
            return HandlerResult::Retry(e.to_string());
        }

        match self
            .router
            .publish(message.tier, Envelope::Embed(message.forward(entity_ref)))
            .await
        {
            Ok(_) => HandlerResult::Ack,
            Err(e) => HandlerResult::Retry(e.to_string()),
        }
    }

    async fn fail(&self, message: &PipelineMessage, reason: &str) -> HandlerResult {
        error!(
            subsystem = "jobs",
            component = "transform",
            job_id = %message.job_id,
            step = %message.step,
            record_type = message.effective_type(),
            error = reason,
            "Transform failed"
        );
        match self
            .tracker
            .fail_step(
                message.job_id,
                message.run_id,
                &message.step,
                Stage::Transform,
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
impl StageHandler for TransformWorker {
    fn stage(&self) -> Stage {
        Stage::Transform
    }

    async fn handle(&self, ctx: &MessageContext) -> HandlerResult {
        match ctx.envelope() {
            Envelope::Transform(message) => self.process(message).await,
            other => HandlerResult::Failed(format!(
                "unexpected {} envelope on {}",
                other.stage(),
                ctx.queue()
            )),
        }
    }

    async fn abandon(&self, ctx: &MessageContext, reason: &str) {
        if let Envelope::Transform(message) = ctx.envelope() {
            if let HandlerResult::Retry(e) = self.fail(message, reason).await {
                error!(
                    subsystem = "jobs",
                    component = "transform",
                    job_id = %message.job_id,
                    error = %e,
                    "Could not record abandoned transform message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{
        Delivery, EventBus, Job, JobRepository, MessageFlags, OverallStatus, QueueId,
        StageStatus, Tenant, Tier,
    };
    use conduit_db::{
        InMemoryEntityStore, InMemoryJobRepository, InMemoryQueueBroker, InMemoryRawRecordStore,
    };
    use serde_json::json;
    use uuid::Uuid;

    struct Harness {
        worker: TransformWorker,
        raw: Arc<InMemoryRawRecordStore>,
        entities: Arc<InMemoryEntityStore>,
        router: QueueRouter,
        tracker: JobStatusTracker,
        job: Job,
    }

    async fn harness() -> Harness {
        let jobs: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
        let tracker = JobStatusTracker::new(jobs.clone(), Arc::new(EventBus::new(64)));
        let router = QueueRouter::new(Arc::new(InMemoryQueueBroker::new()));
        let raw = Arc::new(InMemoryRawRecordStore::new());
        let entities = Arc::new(InMemoryEntityStore::new());
        let job = Job::new(
            &Tenant::new(Uuid::new_v4(), Tier::Free),
            Uuid::new_v4(),
            "github",
            crate::plan::PipelinePlan::github().status_document(),
            3600,
        );
        jobs.insert(&job).await.unwrap();
        let job = tracker.start_run(job.id).await.unwrap();
        let worker = TransformWorker::new(
            raw.clone(),
            entities.clone(),
            Arc::new(MapperRegistry::new()),
            router.clone(),
            tracker.clone(),
        );
        Harness {
            worker,
            raw,
            entities,
            router,
            tracker,
            job,
        }
    }

    fn message(job: &Job, raw_data_id: Option<Uuid>, flags: MessageFlags) -> PipelineMessage {
        PipelineMessage {
            job_id: job.id,
            run_id: job.run_id.unwrap(),
            tenant_id: job.tenant_id,
            tier: job.tier,
            step: "github_repositories".into(),
            record_type: "repositories".into(),
            raw_data_id,
            nested_type: None,
            entity_ref: None,
            flags,
        }
    }

    fn ctx(message: PipelineMessage) -> MessageContext {
        MessageContext::new(
            Delivery {
                id: Uuid::new_v4(),
                queue: QueueId::route(Tier::Free, Stage::Transform),
                envelope: Envelope::Transform(message),
                attempts: 1,
            },
            0,
        )
    }

    async fn forwarded(router: &QueueRouter) -> PipelineMessage {
        match router
            .consume(QueueId::route(Tier::Free, Stage::Embedding))
            .await
            .unwrap()
            .map(|d| d.envelope)
        {
            Some(Envelope::Embed(m)) => m,
            other => panic!("expected embed message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upserts_entity_and_forwards_flags() {
        let h = harness().await;
        let id = h
            .raw
            .put(h.job.id, "repositories", "acme/api", json!({"name": "api"}))
            .await
            .unwrap();
        let flags = MessageFlags::new(true, true, false);

        let result = h.worker.handle(&ctx(message(&h.job, Some(id), flags))).await;
        assert_eq!(result, HandlerResult::Ack);

        let out = forwarded(&h.router).await;
        assert_eq!(out.flags, flags);
        let entity_ref = out.entity_ref.unwrap();
        assert_eq!(entity_ref.natural_key, "acme/api");
        assert_eq!(h.entities.count(Some("repositories")).await.unwrap(), 1);

        let job = h.tracker.load(h.job.id).await.unwrap();
        assert_eq!(
            job.status.step("github_repositories").unwrap().transform,
            StageStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let h = harness().await;
        let id = h
            .raw
            .put(h.job.id, "repositories", "acme/api", json!({"name": "api"}))
            .await
            .unwrap();
        for _ in 0..2 {
            let result = h
                .worker
                .handle(&ctx(message(&h.job, Some(id), MessageFlags::NONE)))
                .await;
            assert_eq!(result, HandlerResult::Ack);
        }
        assert_eq!(h.entities.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_synthetic_message_passes_through() {
        let h = harness().await;
        let flags = MessageFlags::new(true, true, true);
        let result = h.worker.handle(&ctx(message(&h.job, None, flags))).await;
        assert_eq!(result, HandlerResult::Ack);

        let out = forwarded(&h.router).await;
        assert!(out.is_synthetic());
        assert!(out.entity_ref.is_none());
        assert_eq!(out.flags, flags);
    }

    #[tokio::test]
    async fn test_missing_raw_record_is_retried() {
        let h = harness().await;
        let result = h
            .worker
            .handle(&ctx(message(&h.job, Some(Uuid::new_v4()), MessageFlags::NONE)))
            .await;
        assert!(matches!(result, HandlerResult::Retry(_)));
    }

    #[tokio::test]
    async fn test_unmappable_record_fails_step() {
        let h = harness().await;
        let id = h
            .raw
            .put(h.job.id, "repositories", "acme/api", json!(["not", "an", "object"]))
            .await
            .unwrap();
        let result = h
            .worker
            .handle(&ctx(message(&h.job, Some(id), MessageFlags::NONE)))
            .await;
        assert!(matches!(result, HandlerResult::Failed(_)));

        let job = h.tracker.load(h.job.id).await.unwrap();
        assert_eq!(job.status.overall, OverallStatus::Failed);
        assert_eq!(
            job.status.step("github_repositories").unwrap().transform,
            StageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_message_from_superseded_run_is_dropped() {
        let h = harness().await;
        let id = h
            .raw
            .put(h.job.id, "repositories", "acme/api", json!({"name": "api"}))
            .await
            .unwrap();
        let mut stale = message(&h.job, Some(id), MessageFlags::new(true, true, true));
        stale.run_id = Uuid::new_v4();

        let result = h.worker.handle(&ctx(stale)).await;
        assert_eq!(result, HandlerResult::Ack);

        assert_eq!(h.entities.count(None).await.unwrap(), 0);
        assert!(h
            .router
            .consume(QueueId::route(Tier::Free, Stage::Embedding))
            .await
            .unwrap()
            .is_none());
        let job = h.tracker.load(h.job.id).await.unwrap();
        assert_eq!(
            job.status.step("github_repositories").unwrap().transform,
            StageStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_unrecorded_failure_asks_for_retry() {
        let h = harness().await;
        let mut orphan = message(&h.job, None, MessageFlags::NONE);
        orphan.job_id = Uuid::new_v4();

        let result = h.worker.fail(&orphan, "abandoned after 5 deliveries").await;
        assert!(matches!(result, HandlerResult::Retry(_)));
        // abandon logs the unrecorded failure instead of propagating it.
        h.worker.abandon(&ctx(orphan), "abandoned after 5 deliveries").await;
    }
}
