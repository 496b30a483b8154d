//! Job creation and run scheduling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use conduit_core::defaults::SCHEDULE_INTERVAL_SECS;
use conduit_core::{Envelope, Error, ExtractionRequest, Job, Result, Stage, Tenant};

use crate::router::QueueRouter;
use crate::source::SourceRegistry;
use crate::tracker::JobStatusTracker;

pub struct Scheduler {
    sources: Arc<SourceRegistry>,
    router: QueueRouter,
    tracker: JobStatusTracker,
}

impl Scheduler {
    pub fn new(sources: Arc<SourceRegistry>, router: QueueRouter, tracker: JobStatusTracker) -> Self {
        Self {
            sources,
            router,
            tracker,
        }
    }

    /// Create the job for a tenant's integration. The status document comes
    /// from the source's plan: READY, every stage idle. The job is due
    /// immediately.
    pub async fn create_job(
        &self,
        tenant: &Tenant,
        integration_id: Uuid,
        source: &str,
        interval_secs: Option<i64>,
    ) -> Result<Job> {
        let plan = self.sources.plan(source)?;
        if plan.steps.is_empty() {
            return Err(Error::Config(format!("source {} has no steps", source)));
        }
        let interval = interval_secs.unwrap_or(SCHEDULE_INTERVAL_SECS);
        if interval <= 0 {
            return Err(Error::InvalidInput(format!(
                "schedule interval must be positive, got {}",
                interval
            )));
        }

        let job = Job::new(tenant, integration_id, source, plan.status_document(), interval);
        self.tracker.jobs().insert(&job).await?;
        info!(
            subsystem = "jobs",
            component = "scheduler",
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            tier = %job.tier,
            source,
            steps = plan.steps.len(),
            "Job created"
        );
        Ok(job)
    }

    /// Start a run: `READY -> RUNNING` as a compare-and-set, then enqueue
    /// the first step's opening request on the tier's extraction queue.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "scheduler", op = "start_job"))]
    pub async fn start_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.tracker.load(job_id).await?;
        let plan = self.sources.plan(&job.source)?;
        let first = plan
            .steps
            .first()
            .ok_or_else(|| Error::Config(format!("source {} has no steps", job.source)))?;

        let job = self.tracker.start_run(job_id).await?;
        let opening = ExtractionRequest::start_of_step(&job, &first.name, first.source.initial_cursor());
        let opening_run = opening.run_id;
        if let Err(e) = self.router.publish(job.tier, Envelope::Extract(opening)).await {
            // Nothing will ever drive the run forward; fail it so it can be reset.
            self.tracker
                .fail_step(job_id, opening_run, &first.name, Stage::Extraction, &e.to_string())
                .await?;
            return Err(e);
        }
        debug!(step = %first.name, tier = %job.tier, "Opening extraction request enqueued");
        Ok(job)
    }

    /// Start every READY job whose `next_run_at` has passed. Returns how many
    /// started. Jobs another caller started first are skipped.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.tracker.jobs().list_due(now).await?;
        let mut started = 0;
        for job in due {
            match self.start_job(job.id).await {
                Ok(_) => started += 1,
                Err(Error::InvalidState(reason)) => {
                    debug!(
                        subsystem = "jobs",
                        component = "scheduler",
                        job_id = %job.id,
                        reason,
                        "Due job skipped"
                    );
                }
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "scheduler",
                        job_id = %job.id,
                        error = %e,
                        "Failed to start due job"
                    );
                }
            }
        }
        Ok(started)
    }

    /// Run [`Scheduler::run_due`] every `interval` until cancelled. The first
    /// scan happens one interval after the call.
    pub fn spawn_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                subsystem = "jobs",
                component = "scheduler",
                interval_secs = interval.as_secs(),
                "Scheduler started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.run_due(Utc::now()).await {
                            Ok(0) => {}
                            Ok(started) => debug!(subsystem = "jobs", component = "scheduler", started, "Due jobs started"),
                            Err(e) => warn!(subsystem = "jobs", component = "scheduler", error = %e, "Scheduler tick failed"),
                        }
                    }
                }
            }
            info!(subsystem = "jobs", component = "scheduler", "Scheduler stopped");
        })
    }
}
