//! Extraction stage: pulls paginated records from a job's source, persists
//! them raw, and publishes one Transform message per record.
//!
//! Each [`ExtractionRequest`] fetches one page of its step and enqueues at
//! most one continuation, so a step's extraction is a single ordered chain.
//! Position flags are decided at emission time from the request's
//! [`CompletionToken`](conduit_core::CompletionToken); a chain that ends
//! without having emitted its terminal message emits a synthetic one.
//!
//! Delivery is at least once. A redelivered request (retry or handler
//! timeout) fetches and emits its whole page again, sub-resource walk
//! included, with the same flags. Downstream this is absorbed: raw records
//! and entities are keyed by natural key, sub-status transitions never
//! regress, and finalization is a per-run compare-and-set.

mod emitter;
mod flat;
mod nested;
mod retry;

pub use retry::{fetch_with_retry, RetryPolicy};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use conduit_core::{
    Envelope, Error, ExtractionCursor, ExtractionRequest, Job, RawRecordStore, Result, Stage,
    StageStatus,
};

use crate::handler::{HandlerResult, MessageContext, StageHandler};
use crate::plan::{PipelinePlan, StepSource};
use crate::router::QueueRouter;
use crate::source::SourceRegistry;
use crate::tracker::JobStatusTracker;

use emitter::Emitter;
use nested::NestedSource;

/// How a failed extraction request is resolved.
#[derive(Debug)]
pub(crate) enum StepError {
    /// Redeliver the request.
    Retry(Error),
    /// Fail the step and the job.
    Fail(Error),
}

impl StepError {
    /// Store and queue errors are retried when transient.
    pub(crate) fn from_store(e: Error) -> Self {
        if e.is_transient() {
            StepError::Retry(e)
        } else {
            StepError::Fail(e)
        }
    }
}

/// Outcome of one processed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// The job was not RUNNING; nothing was fetched.
    Dropped,
    /// Items were emitted and a continuation was enqueued.
    Continued { emitted: usize },
    /// The step's chain ended here.
    StepFinished { emitted: usize, next_step: Option<String> },
}

pub struct ExtractionWorker {
    sources: Arc<SourceRegistry>,
    raw_records: Arc<dyn RawRecordStore>,
    router: QueueRouter,
    tracker: JobStatusTracker,
    retry: RetryPolicy,
}

impl ExtractionWorker {
    pub fn new(
        sources: Arc<SourceRegistry>,
        raw_records: Arc<dyn RawRecordStore>,
        router: QueueRouter,
        tracker: JobStatusTracker,
    ) -> Self {
        Self {
            sources,
            raw_records,
            router,
            tracker,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process one request end to end.
    #[instrument(
        skip(self, request),
        fields(
            subsystem = "jobs",
            component = "extraction",
            op = "process",
            job_id = %request.job_id,
            step = %request.step
        )
    )]
    pub(crate) async fn process(
        &self,
        request: &ExtractionRequest,
    ) -> std::result::Result<ExtractionOutcome, StepError> {
        let start = Instant::now();
        let job = match self.tracker.load(request.job_id).await {
            Ok(job) => job,
            Err(Error::JobNotFound(id)) => {
                warn!(job_id = %id, "Dropping extraction request for unknown job");
                return Ok(ExtractionOutcome::Dropped);
            }
            Err(e) => return Err(StepError::from_store(e)),
        };
        if !job.is_running() {
            info!(
                overall = %job.status.overall,
                "Dropping extraction request; job not running"
            );
            return Ok(ExtractionOutcome::Dropped);
        }
        if !job.is_current_run(request.run_id) {
            info!(
                run_id = %request.run_id,
                "Dropping extraction request from a superseded run"
            );
            return Ok(ExtractionOutcome::Dropped);
        }

        let plan = self.sources.plan(&request.source).map_err(StepError::Fail)?;
        let client = self.sources.client(&request.source).map_err(StepError::Fail)?;
        let step = plan.step(&request.step).ok_or_else(|| {
            StepError::Fail(Error::InvalidInput(format!(
                "source {} has no step {}",
                request.source, request.step
            )))
        })?;

        self.tracker
            .begin_stage(request.job_id, request.run_id, &request.step, Stage::Extraction)
            .await
            .map_err(StepError::from_store)?;

        let mut emitter = Emitter::new(self.raw_records.as_ref(), &self.router, request);
        let continuation = match &step.source {
            StepSource::Flat { resource } => {
                let page = match &request.cursor {
                    ExtractionCursor::Flat { page } => page.clone(),
                    _ => {
                        return Err(StepError::Fail(Error::InvalidInput(format!(
                            "step {} expects a flat cursor",
                            request.step
                        ))))
                    }
                };
                flat::run(client.as_ref(), &self.retry, resource, page, request, &mut emitter)
                    .await?
            }
            StepSource::Nested {
                parent_resource,
                child_resource,
                sub_resources,
            } => {
                let source = NestedSource {
                    parent_resource,
                    child_resource,
                    sub_resources,
                };
                nested::run(client.as_ref(), &self.retry, &source, request, &mut emitter).await?
            }
        };

        if let Some(next) = continuation {
            self.router
                .publish(request.tier, Envelope::Extract(next))
                .await
                .map_err(StepError::from_store)?;
            debug!(
                emitted = emitter.emitted(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Page extracted; continuation enqueued"
            );
            return Ok(ExtractionOutcome::Continued {
                emitted: emitter.emitted(),
            });
        }

        if !emitter.terminal_emitted() {
            emitter
                .emit_synthetic(step.source.primary_resource())
                .await?;
        }
        self.tracker
            .finish_stage(request.job_id, request.run_id, &request.step, Stage::Extraction)
            .await
            .map_err(StepError::from_store)?;

        let next_step = self.start_next_step(&plan, request).await?;
        info!(
            emitted = emitter.emitted(),
            next_step = next_step.as_deref().unwrap_or("-"),
            duration_ms = start.elapsed().as_millis() as u64,
            "Extraction step complete"
        );
        Ok(ExtractionOutcome::StepFinished {
            emitted: emitter.emitted(),
            next_step,
        })
    }

    /// Enqueue the opening request of the step after `request.step`, unless
    /// that step's extraction has already begun.
    async fn start_next_step(
        &self,
        plan: &PipelinePlan,
        request: &ExtractionRequest,
    ) -> std::result::Result<Option<String>, StepError> {
        let job: Job = self
            .tracker
            .load(request.job_id)
            .await
            .map_err(StepError::from_store)?;
        let Some(next) = job.status.step_after(&request.step).map(str::to_string) else {
            return Ok(None);
        };
        let already_started = job
            .status
            .step(&next)
            .map(|s| s.extraction != StageStatus::Idle)
            .unwrap_or(false);
        if already_started {
            return Ok(Some(next));
        }

        let step_plan = plan.step(&next).ok_or_else(|| {
            StepError::Fail(Error::InvalidInput(format!(
                "source {} has no step {}",
                request.source, next
            )))
        })?;
        let opening = ExtractionRequest::start_of_step(&job, &next, step_plan.source.initial_cursor());
        self.router
            .publish(request.tier, Envelope::Extract(opening))
            .await
            .map_err(StepError::from_store)?;
        Ok(Some(next))
    }

    async fn fail(&self, request: &ExtractionRequest, reason: &str) -> Result<bool> {
        self.tracker
            .fail_step(
                request.job_id,
                request.run_id,
                &request.step,
                Stage::Extraction,
                reason,
            )
            .await
    }
}

#[async_trait]
impl StageHandler for ExtractionWorker {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    async fn handle(&self, ctx: &MessageContext) -> HandlerResult {
        let Envelope::Extract(request) = ctx.envelope() else {
            return HandlerResult::Failed(format!(
                "unexpected {} envelope on {}",
                ctx.envelope().stage(),
                ctx.queue()
            ));
        };

        match self.process(request).await {
            Ok(_) => HandlerResult::Ack,
            Err(StepError::Retry(e)) => HandlerResult::Retry(e.to_string()),
            Err(StepError::Fail(e)) => {
                let reason = e.to_string();
                error!(
                    subsystem = "jobs",
                    component = "extraction",
                    job_id = %request.job_id,
                    step = %request.step,
                    error = %reason,
                    "Extraction failed"
                );
                if let Err(store_err) = self.fail(request, &reason).await {
                    return HandlerResult::Retry(store_err.to_string());
                }
                HandlerResult::Failed(reason)
            }
        }
    }

    async fn abandon(&self, ctx: &MessageContext, reason: &str) {
        if let Envelope::Extract(request) = ctx.envelope() {
            if let Err(e) = self.fail(request, reason).await {
                error!(
                    subsystem = "jobs",
                    component = "extraction",
                    job_id = %request.job_id,
                    error = %e,
                    "Could not record abandoned extraction"
                );
            }
        }
    }
}
