//! Wiring of the pipeline's components over one set of stores.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use conduit_core::{EmbeddingBackend, EventBus, Result};
use conduit_db::Stores;

use crate::completion::{CompletionController, CompletionMonitor};
use crate::config::{EmbeddingProvider, PipelineConfig};
use crate::embedding::{EmbeddingWorker, HashingEmbedder, OllamaEmbedder};
use crate::extraction::ExtractionWorker;
use crate::mapper::MapperRegistry;
use crate::router::QueueRouter;
use crate::scheduler::Scheduler;
use crate::source::SourceRegistry;
use crate::supervisor::WorkerPoolSupervisor;
use crate::tracker::JobStatusTracker;
use crate::transform::TransformWorker;

/// All long-lived components, sharing one event bus, router and tracker.
pub struct Pipeline {
    pub config: PipelineConfig,
    pub stores: Stores,
    pub events: Arc<EventBus>,
    pub router: QueueRouter,
    pub tracker: JobStatusTracker,
    pub sources: Arc<SourceRegistry>,
    pub supervisor: Arc<WorkerPoolSupervisor>,
    pub scheduler: Arc<Scheduler>,
    pub completion: Arc<CompletionController>,
}

impl Pipeline {
    pub fn new(
        stores: Stores,
        sources: SourceRegistry,
        mappers: MapperRegistry,
        backend: Arc<dyn EmbeddingBackend>,
        config: PipelineConfig,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let router = QueueRouter::new(stores.queue.clone());
        let tracker = JobStatusTracker::new(stores.jobs.clone(), events.clone());
        let sources = Arc::new(sources);

        let extraction = ExtractionWorker::new(
            sources.clone(),
            stores.raw_records.clone(),
            router.clone(),
            tracker.clone(),
        )
        .with_retry_policy(config.retry);
        let transform = TransformWorker::new(
            stores.raw_records.clone(),
            stores.entities.clone(),
            Arc::new(mappers),
            router.clone(),
            tracker.clone(),
        );
        let embedding = EmbeddingWorker::new(
            stores.entities.clone(),
            stores.vectors.clone(),
            backend,
            tracker.clone(),
        )
        .with_max_chars(config.embed_max_chars);

        let supervisor = WorkerPoolSupervisor::new(
            router.clone(),
            events.clone(),
            config.worker.clone(),
            config.pools,
        )
        .with_handler(Arc::new(extraction))
        .with_handler(Arc::new(transform))
        .with_handler(Arc::new(embedding));

        let scheduler = Scheduler::new(sources.clone(), router.clone(), tracker.clone());
        let completion = CompletionController::new(tracker.clone(), config.completion.clone());

        Self {
            config,
            stores,
            events,
            router,
            tracker,
            sources,
            supervisor: Arc::new(supervisor),
            scheduler: Arc::new(scheduler),
            completion: Arc::new(completion),
        }
    }

    /// Embedding backend selected by `config.embedding_provider`.
    pub fn embedding_backend(config: &PipelineConfig) -> Arc<dyn EmbeddingBackend> {
        match config.embedding_provider {
            EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::default()),
            EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::from_env()),
        }
    }

    /// Start the worker pools (unless disabled), the completion monitor and
    /// the scheduler loop.
    pub async fn start(&self) -> Result<PipelineHandle> {
        let cancel = CancellationToken::new();
        let pools = self.supervisor.start_all().await?;

        let monitor = CompletionMonitor::new(self.completion.clone(), self.tracker.clone())
            .spawn(cancel.child_token());
        let scheduler = self
            .scheduler
            .clone()
            .spawn_loop(self.config.scheduler_tick, cancel.child_token());

        info!(
            subsystem = "jobs",
            component = "pipeline",
            pools,
            sources = ?self.sources.available_sources(),
            "Pipeline started"
        );
        Ok(PipelineHandle {
            cancel,
            supervisor: self.supervisor.clone(),
            tasks: vec![monitor, scheduler],
        })
    }
}

/// Background tasks of a started [`Pipeline`].
pub struct PipelineHandle {
    cancel: CancellationToken,
    supervisor: Arc<WorkerPoolSupervisor>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the scheduler and monitor, then drain every pool.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        futures::future::join_all(self.tasks).await;
        self.supervisor.shutdown().await;
        info!(subsystem = "jobs", component = "pipeline", "Pipeline stopped");
    }
}
