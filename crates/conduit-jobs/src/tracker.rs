//! Job status tracker: the only writer of job sub-statuses.
//!
//! Sub-status transitions are monotonic within a run
//! (`idle -> running -> finished`, or `-> failed`). A transition that would
//! move backwards is ignored, so duplicated or reordered flag messages are
//! harmless. Every effective change publishes the full status document.
//!
//! Each run gets a fresh `run_id`. Run-scoped operations name the run they
//! belong to and are ignored, inside the same atomic mutation, once the job
//! has moved on to another run.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conduit_core::{
    Error, EventBus, Job, JobMutation, JobRepository, JobUpdate, MessageFlags, OverallStatus,
    Result, ServerEvent, Stage, StageStatus,
};

#[derive(Clone)]
pub struct JobStatusTracker {
    jobs: Arc<dyn JobRepository>,
    events: Arc<EventBus>,
}

impl JobStatusTracker {
    pub fn new(jobs: Arc<dyn JobRepository>, events: Arc<EventBus>) -> Self {
        Self { jobs, events }
    }

    pub fn jobs(&self) -> &Arc<dyn JobRepository> {
        &self.jobs
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Load a job or fail with [`Error::JobNotFound`].
    pub async fn load(&self, job_id: Uuid) -> Result<Job> {
        self.jobs.get(job_id).await?.ok_or(Error::JobNotFound(job_id))
    }

    /// Whether `run_id` is still the job's current run. An unknown job has
    /// no current run.
    pub async fn is_current_run(&self, job_id: Uuid, run_id: Uuid) -> Result<bool> {
        match self.jobs.get(job_id).await? {
            Some(job) => Ok(job.is_current_run(run_id)),
            None => Ok(false),
        }
    }

    /// Apply a mutation and publish the document when it changed.
    pub async fn apply(&self, job_id: Uuid, mutation: JobMutation) -> Result<JobUpdate> {
        let update = self.jobs.modify(job_id, mutation).await?;
        if update.changed {
            self.events.emit(ServerEvent::JobStatusChanged {
                job_id,
                tenant_id: update.job.tenant_id,
                status: update.job.status.clone(),
            });
        }
        Ok(update)
    }

    /// Handle the position flags of a message about to be processed.
    pub async fn on_message_start(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        step: &str,
        stage: Stage,
        flags: MessageFlags,
    ) -> Result<()> {
        if flags.first_item {
            self.begin_stage(job_id, run_id, step, stage).await?;
        }
        Ok(())
    }

    /// Handle the position flags of a message whose work is done.
    pub async fn on_message_end(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        step: &str,
        stage: Stage,
        flags: MessageFlags,
    ) -> Result<()> {
        if flags.last_item {
            self.finish_stage(job_id, run_id, step, stage).await?;
        }
        Ok(())
    }

    /// Start and end handling for a message with no work of its own.
    pub async fn apply_flags(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        step: &str,
        stage: Stage,
        flags: MessageFlags,
    ) -> Result<()> {
        self.on_message_start(job_id, run_id, step, stage, flags).await?;
        self.on_message_end(job_id, run_id, step, stage, flags).await
    }

    /// `idle -> running`. Returns whether the status changed.
    pub async fn begin_stage(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        step: &str,
        stage: Stage,
    ) -> Result<bool> {
        self.transition(job_id, run_id, step, stage, StageStatus::Idle, StageStatus::Running)
            .await
    }

    /// `running -> finished`. A stage still idle passes through running so
    /// observers see both transitions.
    pub async fn finish_stage(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        step: &str,
        stage: Stage,
    ) -> Result<bool> {
        let began = self.begin_stage(job_id, run_id, step, stage).await?;
        if began {
            debug!(
                subsystem = "jobs",
                component = "tracker",
                %job_id,
                step,
                %stage,
                "Terminal flag arrived before first flag; passing through running"
            );
        }
        self.transition(job_id, run_id, step, stage, StageStatus::Running, StageStatus::Finished)
            .await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        step: &str,
        stage: Stage,
        from: StageStatus,
        to: StageStatus,
    ) -> Result<bool> {
        let step_name = step.to_string();
        let update = self
            .apply(
                job_id,
                Box::new(move |job: &mut Job| {
                    if !job.is_current_run(run_id) {
                        return Ok(false);
                    }
                    let state = job.status.step_mut(&step_name).ok_or_else(|| {
                        Error::InvalidInput(format!("job has no step {}", step_name))
                    })?;
                    if state.status(stage) != from {
                        return Ok(false);
                    }
                    state.set_status(stage, to);
                    Ok(true)
                }),
            )
            .await?;

        if update.changed {
            debug!(
                subsystem = "jobs",
                component = "tracker",
                %job_id,
                step,
                %stage,
                from = %from,
                to = %to,
                "Sub-status transition"
            );
        }
        Ok(update.changed)
    }

    /// Mark a stage failed and the job FAILED.
    pub async fn fail_step(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        step: &str,
        stage: Stage,
        error: &str,
    ) -> Result<bool> {
        let step_name = step.to_string();
        let message = error.to_string();
        let update = self
            .apply(
                job_id,
                Box::new(move |job: &mut Job| {
                    if !job.is_current_run(run_id) {
                        return Ok(false);
                    }
                    let mut changed = false;
                    if let Some(state) = job.status.step_mut(&step_name) {
                        if state.status(stage) != StageStatus::Failed {
                            state.set_status(stage, StageStatus::Failed);
                            changed = true;
                        }
                    }
                    if job.status.overall == OverallStatus::Running {
                        job.status.overall = OverallStatus::Failed;
                        job.error_message = Some(message);
                        job.last_run_finished_at = Some(Utc::now());
                        changed = true;
                    }
                    Ok(changed)
                }),
            )
            .await?;

        if update.changed {
            warn!(
                subsystem = "jobs",
                component = "tracker",
                %job_id,
                step,
                %stage,
                error,
                "Step failed"
            );
            self.events.emit(ServerEvent::JobFailed {
                job_id,
                tenant_id: update.job.tenant_id,
                step: step.to_string(),
                stage,
                error: error.to_string(),
            });
        }
        Ok(update.changed)
    }

    /// `RUNNING -> FINISHED`, performed once per run on the job-terminal
    /// message. Returns false when the job was not RUNNING or `run_id` is
    /// not its current run.
    pub async fn finalize(&self, job_id: Uuid, run_id: Uuid) -> Result<bool> {
        let update = self
            .apply(
                job_id,
                Box::new(move |job: &mut Job| {
                    if !job.is_current_run(run_id) || job.status.overall != OverallStatus::Running {
                        return Ok(false);
                    }
                    job.status.overall = OverallStatus::Finished;
                    job.last_run_finished_at = Some(Utc::now());
                    Ok(true)
                }),
            )
            .await?;

        if update.changed {
            info!(
                subsystem = "jobs",
                component = "tracker",
                %job_id,
                "Job finalized"
            );
            self.events.emit(ServerEvent::JobFinalized {
                job_id,
                tenant_id: update.job.tenant_id,
            });
        } else {
            debug!(
                subsystem = "jobs",
                component = "tracker",
                %job_id,
                overall = %update.job.status.overall,
                "Finalize skipped; job not running or run superseded"
            );
        }
        Ok(update.changed)
    }

    /// `READY -> RUNNING` under a new `run_id`. Fails with
    /// [`Error::InvalidState`] otherwise.
    pub async fn start_run(&self, job_id: Uuid) -> Result<Job> {
        let update = self
            .apply(
                job_id,
                Box::new(|job: &mut Job| {
                    if job.status.overall != OverallStatus::Ready {
                        return Err(Error::InvalidState(format!(
                            "job {} is {}, not READY",
                            job.id, job.status.overall
                        )));
                    }
                    for step in job.status.steps.values_mut() {
                        step.reset();
                    }
                    job.status.overall = OverallStatus::Running;
                    job.run_id = Some(Uuid::now_v7());
                    job.error_message = None;
                    job.last_run_started_at = Some(Utc::now());
                    Ok(true)
                }),
            )
            .await?;

        info!(
            subsystem = "jobs",
            component = "tracker",
            job_id = %update.job.id,
            tenant_id = %update.job.tenant_id,
            tier = %update.job.tier,
            run_id = ?update.job.run_id,
            "Job started"
        );
        self.events.emit(ServerEvent::JobStarted {
            job_id,
            tenant_id: update.job.tenant_id,
            source: update.job.source.clone(),
        });
        Ok(update.job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{JobStatusDocument, StepState, Tenant, Tier};
    use conduit_db::InMemoryJobRepository;

    async fn setup() -> (JobStatusTracker, Job) {
        let jobs: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
        let tracker = JobStatusTracker::new(jobs.clone(), Arc::new(EventBus::new(64)));
        let status = JobStatusDocument::new()
            .with_step("repos", StepState::new(1, "Repositories"))
            .with_step("prs", StepState::new(2, "Pull Requests"));
        let job = Job::new(
            &Tenant::new(Uuid::new_v4(), Tier::Free),
            Uuid::new_v4(),
            "github",
            status,
            3600,
        );
        jobs.insert(&job).await.unwrap();
        (tracker, job)
    }

    /// A job already moved to RUNNING, with its run id.
    async fn running() -> (JobStatusTracker, Job, Uuid) {
        let (tracker, job) = setup().await;
        let job = tracker.start_run(job.id).await.unwrap();
        let run = job.run_id.unwrap();
        (tracker, job, run)
    }

    #[tokio::test]
    async fn test_transitions_are_monotonic() {
        let (tracker, job, run) = running().await;
        assert!(tracker.begin_stage(job.id, run, "repos", Stage::Transform).await.unwrap());
        assert!(!tracker.begin_stage(job.id, run, "repos", Stage::Transform).await.unwrap());
        assert!(tracker.finish_stage(job.id, run, "repos", Stage::Transform).await.unwrap());
        // A late first_item must not move finished back to running.
        assert!(!tracker.begin_stage(job.id, run, "repos", Stage::Transform).await.unwrap());

        let stored = tracker.load(job.id).await.unwrap();
        assert_eq!(
            stored.status.step("repos").unwrap().transform,
            StageStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_finish_from_idle_publishes_both_transitions() {
        let (tracker, job, run) = running().await;
        let mut rx = tracker.events().subscribe();

        assert!(tracker.finish_stage(job.id, run, "prs", Stage::Embedding).await.unwrap());

        let mut seen = Vec::new();
        while let Ok(env) = rx.try_recv() {
            if let ServerEvent::JobStatusChanged { status, .. } = env.payload {
                seen.push(status.step("prs").unwrap().embedding);
            }
        }
        assert_eq!(seen, vec![StageStatus::Running, StageStatus::Finished]);
    }

    #[tokio::test]
    async fn test_unknown_step_is_rejected() {
        let (tracker, job, run) = running().await;
        let err = tracker
            .begin_stage(job.id, run, "nope", Stage::Extraction)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_finalize_is_compare_and_set() {
        let (tracker, job) = setup().await;
        assert!(!tracker.finalize(job.id, Uuid::new_v4()).await.unwrap());

        let run = tracker.start_run(job.id).await.unwrap().run_id.unwrap();
        assert!(tracker.finalize(job.id, run).await.unwrap());
        assert!(!tracker.finalize(job.id, run).await.unwrap());

        let stored = tracker.load(job.id).await.unwrap();
        assert_eq!(stored.status.overall, OverallStatus::Finished);
        assert!(stored.last_run_finished_at.is_some());
    }

    #[tokio::test]
    async fn test_start_run_requires_ready() {
        let (tracker, job) = setup().await;
        tracker.start_run(job.id).await.unwrap();
        let err = tracker.start_run(job.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_fail_step_marks_job_failed_once() {
        let (tracker, job, run) = running().await;
        let mut rx = tracker.events().subscribe();

        assert!(tracker
            .fail_step(job.id, run, "repos", Stage::Extraction, "Unauthorized: bad token")
            .await
            .unwrap());
        assert!(!tracker
            .fail_step(job.id, run, "repos", Stage::Extraction, "again")
            .await
            .unwrap());

        let stored = tracker.load(job.id).await.unwrap();
        assert_eq!(stored.status.overall, OverallStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Unauthorized: bad token"));

        let failed = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e.payload, ServerEvent::JobFailed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_flag_handlers_follow_flags() {
        let (tracker, job, run) = running().await;
        tracker
            .on_message_start(job.id, run, "repos", Stage::Transform, MessageFlags::NONE)
            .await
            .unwrap();
        assert_eq!(
            tracker.load(job.id).await.unwrap().status.step("repos").unwrap().transform,
            StageStatus::Idle
        );

        let flags = MessageFlags::new(true, true, false);
        tracker
            .on_message_start(job.id, run, "repos", Stage::Transform, flags)
            .await
            .unwrap();
        tracker
            .on_message_end(job.id, run, "repos", Stage::Transform, flags)
            .await
            .unwrap();
        assert_eq!(
            tracker.load(job.id).await.unwrap().status.step("repos").unwrap().transform,
            StageStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_each_run_gets_a_new_id() {
        let (tracker, job, first) = running().await;
        tracker.finalize(job.id, first).await.unwrap();
        tracker
            .apply(
                job.id,
                Box::new(|job: &mut Job| {
                    job.status.reset_to_idle();
                    Ok(true)
                }),
            )
            .await
            .unwrap();

        let second = tracker.start_run(job.id).await.unwrap().run_id.unwrap();
        assert_ne!(first, second);
        assert!(tracker.is_current_run(job.id, second).await.unwrap());
        assert!(!tracker.is_current_run(job.id, first).await.unwrap());
        assert!(!tracker.is_current_run(Uuid::new_v4(), second).await.unwrap());
    }

    #[tokio::test]
    async fn test_superseded_run_cannot_touch_statuses() {
        let (tracker, job, run) = running().await;
        let stale = Uuid::new_v4();

        assert!(!tracker.begin_stage(job.id, stale, "repos", Stage::Transform).await.unwrap());
        assert!(!tracker.finish_stage(job.id, stale, "prs", Stage::Embedding).await.unwrap());
        assert!(!tracker
            .fail_step(job.id, stale, "repos", Stage::Transform, "old failure")
            .await
            .unwrap());
        assert!(!tracker.finalize(job.id, stale).await.unwrap());

        let stored = tracker.load(job.id).await.unwrap();
        assert_eq!(stored.status.overall, OverallStatus::Running);
        assert!(stored.status.steps.values().all(StepState::is_idle));
        assert!(stored.is_current_run(run));
    }
}
