//! Tier router: maps (tier, stage) to one of the fixed shared queues.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;
use uuid::Uuid;

use conduit_core::{
    Delivery, Envelope, Error, QueueBroker, QueueDepth, QueueId, Result, Stage, Tier,
};

/// Routes envelopes onto the tier-scoped queues. Tenant identity never
/// participates, so the queue count stays fixed as tenants are added.
#[derive(Clone)]
pub struct QueueRouter {
    broker: Arc<dyn QueueBroker>,
}

impl QueueRouter {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self { broker }
    }

    /// Pure routing function.
    pub fn route(tier: Tier, stage: Stage) -> QueueId {
        QueueId::route(tier, stage)
    }

    /// Every queue this router can address.
    pub fn queues(&self) -> Vec<QueueId> {
        QueueId::all()
    }

    /// Publish onto the queue for (tier, envelope stage).
    pub async fn publish(&self, tier: Tier, envelope: Envelope) -> Result<Uuid> {
        let queue = Self::route(tier, envelope.stage());
        self.publish_to(queue, envelope).await
    }

    /// Publish onto an explicit queue. The envelope must belong to the
    /// queue's stage.
    pub async fn publish_to(&self, queue: QueueId, envelope: Envelope) -> Result<Uuid> {
        if envelope.stage() != queue.stage {
            return Err(Error::InvalidInput(format!(
                "{} envelope cannot be published to {}",
                envelope.stage(),
                queue
            )));
        }
        let id = self.broker.publish(queue, envelope).await?;
        trace!(subsystem = "queue", queue = %queue, message_id = %id, "Routed message");
        Ok(id)
    }

    pub async fn consume(&self, queue: QueueId) -> Result<Option<Delivery>> {
        self.broker.receive(queue).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.broker.ack(delivery).await
    }

    pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.broker.nack(delivery, requeue).await
    }

    /// Wait until something is published to `queue` or `timeout` elapses.
    pub async fn wait(&self, queue: QueueId, timeout: Duration) {
        let notify = self.broker.notifier(queue);
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    pub async fn depth(&self, queue: QueueId) -> Result<QueueDepth> {
        self.broker.depth(queue).await
    }

    pub async fn depths(&self) -> Result<Vec<QueueDepth>> {
        let mut out = Vec::with_capacity(QueueId::all().len());
        for queue in QueueId::all() {
            out.push(self.broker.depth(queue).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{MessageFlags, PipelineMessage};
    use conduit_db::InMemoryQueueBroker;

    fn message(tier: Tier) -> PipelineMessage {
        PipelineMessage {
            job_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            tier,
            step: "github_repositories".into(),
            record_type: "repositories".into(),
            raw_data_id: None,
            nested_type: None,
            entity_ref: None,
            flags: MessageFlags::NONE,
        }
    }

    #[test]
    fn test_route_is_pure_and_total() {
        let mut seen = std::collections::HashSet::new();
        for tier in Tier::ALL {
            for stage in Stage::ALL {
                let q = QueueRouter::route(tier, stage);
                assert_eq!(q, QueueRouter::route(tier, stage));
                seen.insert(q);
            }
        }
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test]
    async fn test_publish_routes_by_tier_and_stage() {
        let broker = Arc::new(InMemoryQueueBroker::new());
        let router = QueueRouter::new(broker.clone());

        router
            .publish(Tier::Premium, Envelope::Embed(message(Tier::Premium)))
            .await
            .unwrap();

        let depth = broker
            .depth(QueueId::route(Tier::Premium, Stage::Embedding))
            .await
            .unwrap();
        assert_eq!(depth.ready, 1);
        let total: u64 = router.depths().await.unwrap().iter().map(|d| d.ready).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_stage_mismatch() {
        let router = QueueRouter::new(Arc::new(InMemoryQueueBroker::new()));
        let err = router
            .publish_to(
                QueueId::route(Tier::Free, Stage::Extraction),
                Envelope::Transform(message(Tier::Free)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_idle() {
        let router = QueueRouter::new(Arc::new(InMemoryQueueBroker::new()));
        let start = tokio::time::Instant::now();
        router
            .wait(QueueId::route(Tier::Free, Stage::Transform), Duration::from_millis(250))
            .await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
