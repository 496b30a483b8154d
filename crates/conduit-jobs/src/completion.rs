//! Completion detection and reset.
//!
//! Workers drive a job to FINISHED; this module takes it from there back to
//! READY. [`CompletionController`] holds the idempotent check and reset
//! operations and the per-job control loop. [`CompletionMonitor`] runs that
//! loop for every job that reaches FINISHED.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conduit_core::defaults::{
    COMPLETION_BACKOFF_SECS, COMPLETION_GRACE_SECS, COMPLETION_SWEEP_SECS,
};
use conduit_core::{
    CompletenessReport, Error, Job, OverallStatus, ResetResponse, Result, ServerEvent,
};

use crate::tracker::JobStatusTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionConfig {
    /// Delays between completeness checks. The check runs once up front and
    /// once after each delay.
    pub backoff: Vec<Duration>,
    /// Settle interval between a successful check and the reset.
    pub grace: Duration,
    /// Interval of the monitor's sweep for FINISHED jobs.
    pub sweep_interval: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            backoff: COMPLETION_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            grace: Duration::from_secs(COMPLETION_GRACE_SECS),
            sweep_interval: Duration::from_secs(COMPLETION_SWEEP_SECS),
        }
    }
}

impl CompletionConfig {
    /// Reads `COMPLETION_BACKOFF_SECS` (comma separated),
    /// `COMPLETION_GRACE_SECS` and `COMPLETION_SWEEP_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backoff = std::env::var("COMPLETION_BACKOFF_SECS")
            .ok()
            .and_then(|v| {
                v.split(',')
                    .map(|s| s.trim().parse::<u64>().map(Duration::from_secs))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .ok()
            })
            .unwrap_or(defaults.backoff);
        let secs = |var: &str, default: Duration| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            backoff,
            grace: secs("COMPLETION_GRACE_SECS", defaults.grace),
            sweep_interval: secs("COMPLETION_SWEEP_SECS", defaults.sweep_interval),
        }
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// How a supervised job left the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperviseOutcome {
    /// Reset to READY.
    Reset,
    /// Never became complete within the backoff schedule.
    Stalled { attempts: u32 },
    /// The job was not (or no longer) FINISHED.
    NotFinished,
    Cancelled,
}

pub struct CompletionController {
    tracker: JobStatusTracker,
    config: CompletionConfig,
}

impl CompletionController {
    pub fn new(tracker: JobStatusTracker, config: CompletionConfig) -> Self {
        Self { tracker, config }
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    pub fn report(job: &Job) -> CompletenessReport {
        CompletenessReport {
            all_finished: job.status.is_complete(),
            steps_status: job.status.steps.clone(),
        }
    }

    /// Whether every step finished all stages. Never mutates.
    pub async fn check_completion(&self, job_id: Uuid) -> Result<CompletenessReport> {
        let job = self.tracker.load(job_id).await?;
        Ok(Self::report(&job))
    }

    /// Return the job to READY with every sub-status idle and schedule the
    /// next run. Repeating it is a no-op. RUNNING jobs are refused.
    pub async fn reset(&self, job_id: Uuid) -> Result<ResetResponse> {
        let update = self
            .tracker
            .apply(
                job_id,
                Box::new(|job: &mut Job| {
                    if job.is_running() {
                        return Err(Error::InvalidState(format!(
                            "job {} is RUNNING and cannot be reset",
                            job.id
                        )));
                    }
                    if job.status.is_reset() && job.error_message.is_none() {
                        return Ok(false);
                    }
                    job.status.reset_to_idle();
                    job.error_message = None;
                    job.next_run_at =
                        Some(Utc::now() + chrono::Duration::seconds(job.schedule_interval_secs));
                    Ok(true)
                }),
            )
            .await?;

        if update.changed {
            info!(
                subsystem = "jobs",
                component = "completion",
                %job_id,
                next_run_at = ?update.job.next_run_at,
                "Job reset"
            );
            self.tracker.events().emit(ServerEvent::JobReset {
                job_id,
                tenant_id: update.job.tenant_id,
                next_run_at: update.job.next_run_at,
            });
        }

        Ok(ResetResponse {
            success: true,
            overall: update.job.status.overall,
            steps: update.job.status.steps,
        })
    }

    /// Control loop for one FINISHED job: check, back off, stall or settle
    /// and reset. Every wait is cancellable.
    pub async fn supervise(&self, job_id: Uuid, cancel: CancellationToken) -> Result<SuperviseOutcome> {
        let checks = self.config.backoff.len() + 1;
        for attempt in 0..checks {
            let job = self.tracker.load(job_id).await?;
            if job.status.overall != OverallStatus::Finished {
                debug!(
                    subsystem = "jobs",
                    component = "completion",
                    %job_id,
                    overall = %job.status.overall,
                    "Job not finished; leaving completion loop"
                );
                return Ok(SuperviseOutcome::NotFinished);
            }

            if job.status.is_complete() {
                debug!(
                    subsystem = "jobs",
                    component = "completion",
                    %job_id,
                    attempt = attempt + 1,
                    "Job complete; waiting grace interval"
                );
                if !sleep_or_cancel(self.config.grace, &cancel).await {
                    return Ok(SuperviseOutcome::Cancelled);
                }
                return match self.reset(job_id).await {
                    Ok(_) => Ok(SuperviseOutcome::Reset),
                    // Restarted by someone else during the grace interval.
                    Err(Error::InvalidState(_)) => Ok(SuperviseOutcome::NotFinished),
                    Err(e) => Err(e),
                };
            }

            let Some(delay) = self.config.backoff.get(attempt).copied() else {
                break;
            };
            warn!(
                subsystem = "jobs",
                component = "completion",
                %job_id,
                attempt = attempt + 1,
                pending = ?pending_steps(&job),
                retry_in_secs = delay.as_secs(),
                "Job finished but not complete; rechecking"
            );
            if !sleep_or_cancel(delay, &cancel).await {
                return Ok(SuperviseOutcome::Cancelled);
            }
        }

        let attempts = checks as u32;
        let job = self.tracker.load(job_id).await?;
        error!(
            subsystem = "jobs",
            component = "completion",
            %job_id,
            attempts,
            pending = ?pending_steps(&job),
            "Completion stalled; operator attention required"
        );
        self.tracker.events().emit(ServerEvent::CompletionStalled {
            job_id,
            tenant_id: job.tenant_id,
            attempts,
        });
        Ok(SuperviseOutcome::Stalled { attempts })
    }
}

fn pending_steps(job: &Job) -> Vec<String> {
    job.status
        .ordered_steps()
        .into_iter()
        .filter(|(_, s)| !s.is_finished())
        .map(|(n, _)| n.to_string())
        .collect()
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Supervises every job that reaches FINISHED: on the finalize event, and
/// through a periodic sweep that catches missed events. A job is never
/// supervised twice at once; stalled jobs are skipped until they leave
/// FINISHED.
pub struct CompletionMonitor {
    controller: Arc<CompletionController>,
    tracker: JobStatusTracker,
}

impl CompletionMonitor {
    pub fn new(controller: Arc<CompletionController>, tracker: JobStatusTracker) -> Self {
        Self {
            controller,
            tracker,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = self.tracker.events().subscribe();
        let mut sweep = tokio::time::interval(self.controller.config().sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks: JoinSet<(Uuid, Result<SuperviseOutcome>)> = JoinSet::new();
        let mut in_progress: HashSet<Uuid> = HashSet::new();
        let mut stalled: HashMap<Uuid, u32> = HashMap::new();

        info!(subsystem = "jobs", component = "completion", "Completion monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(envelope) => {
                        if let ServerEvent::JobFinalized { job_id, .. } = envelope.payload {
                            stalled.remove(&job_id);
                            self.track(job_id, &mut in_progress, &mut tasks, &cancel);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(subsystem = "jobs", component = "completion", missed, "Event stream lagged; sweeping");
                        sweep.reset_immediately();
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sweep.tick() => {
                    match self.tracker.jobs().list_by_status(OverallStatus::Finished).await {
                        Ok(jobs) => {
                            let finished: HashSet<Uuid> = jobs.iter().map(|j| j.id).collect();
                            stalled.retain(|id, _| finished.contains(id));
                            for job in jobs {
                                if !stalled.contains_key(&job.id) {
                                    self.track(job.id, &mut in_progress, &mut tasks, &cancel);
                                }
                            }
                        }
                        Err(e) => warn!(subsystem = "jobs", component = "completion", error = %e, "Sweep failed"),
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((job_id, outcome)) => {
                            in_progress.remove(&job_id);
                            match outcome {
                                Ok(SuperviseOutcome::Stalled { attempts }) => {
                                    stalled.insert(job_id, attempts);
                                }
                                Ok(_) => {}
                                Err(e) => warn!(subsystem = "jobs", component = "completion", %job_id, error = %e, "Completion loop failed"),
                            }
                        }
                        Err(e) => error!(subsystem = "jobs", component = "completion", error = %e, "Completion task panicked"),
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        info!(subsystem = "jobs", component = "completion", "Completion monitor stopped");
    }

    fn track(
        &self,
        job_id: Uuid,
        in_progress: &mut HashSet<Uuid>,
        tasks: &mut JoinSet<(Uuid, Result<SuperviseOutcome>)>,
        cancel: &CancellationToken,
    ) {
        if !in_progress.insert(job_id) {
            return;
        }
        let controller = self.controller.clone();
        let child = cancel.child_token();
        tasks.spawn(async move { (job_id, controller.supervise(job_id, child).await) });
    }
}
