//! # conduit-jobs
//!
//! Queue-driven ingestion pipeline for conduit.
//!
//! This crate provides:
//! - Tier-scoped routing onto the 12 fixed (tier, stage) queues
//! - Worker pools per (tier, stage) with respawn and redelivery budgets
//! - Extraction, Transform and Embedding stage workers
//! - Job status tracking driven by the `first_item` / `last_item` /
//!   `last_job_item` message flags
//! - Completion detection, reset and scheduling
//!
//! ## Example
//!
//! ```ignore
//! use conduit_db::Stores;
//! use conduit_jobs::{FixtureSource, MapperRegistry, Pipeline, PipelineConfig, PipelinePlan, SourceRegistry};
//!
//! let mut sources = SourceRegistry::new();
//! sources.register(PipelinePlan::github(), Arc::new(FixtureSource::github_sample()));
//!
//! let config = PipelineConfig::from_env();
//! let backend = Pipeline::embedding_backend(&config);
//! let pipeline = Pipeline::new(Stores::in_memory(), sources, MapperRegistry::new(), backend, config);
//! let handle = pipeline.start().await?;
//!
//! let job = pipeline.scheduler.create_job(&tenant, integration_id, "github", None).await?;
//! pipeline.scheduler.start_job(job.id).await?;
//!
//! // Graceful shutdown
//! handle.shutdown().await;
//! ```

pub mod completion;
pub mod config;
pub mod embedding;
pub mod extraction;
pub mod fixture;
pub mod handler;
pub mod mapper;
pub mod pipeline;
pub mod plan;
pub mod router;
pub mod scheduler;
pub mod source;
pub mod supervisor;
pub mod tracker;
pub mod transform;

// Re-export core types
pub use conduit_core::*;

pub use completion::{CompletionConfig, CompletionController, CompletionMonitor, SuperviseOutcome};
pub use config::{EmbeddingProvider, PipelineConfig};
pub use embedding::{embedding_text, EmbeddingWorker, HashingEmbedder, OllamaEmbedder};
pub use extraction::{fetch_with_retry, ExtractionOutcome, ExtractionWorker, RetryPolicy};
pub use fixture::{FixtureFailure, FixtureSource};
pub use handler::{HandlerResult, MessageContext, NoOpHandler, StageHandler};
pub use mapper::{EntityMapper, JsonMapper, MapperRegistry};
pub use pipeline::{Pipeline, PipelineHandle};
pub use plan::{PipelinePlan, StepPlan, StepSource};
pub use router::QueueRouter;
pub use scheduler::Scheduler;
pub use source::SourceRegistry;
pub use supervisor::{PoolSizes, WorkerConfig, WorkerPoolSupervisor};
pub use tracker::JobStatusTracker;
pub use transform::TransformWorker;
