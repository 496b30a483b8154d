//! Job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use conduit_core::{
    Error, Job, JobMutation, JobRepository, JobStatusDocument, JobUpdate, OverallStatus, Result,
    Tier,
};

const JOB_COLUMNS: &str = "id, tenant_id, integration_id, source, tier, status, error_message, \
     schedule_interval_secs, run_id, last_run_started_at, last_run_finished_at, next_run_at, \
     created_at, updated_at";

/// PostgreSQL implementation of JobRepository.
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let tier: String = row.get("tier");
        let status: serde_json::Value = row.get("status");
        Ok(Job {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            integration_id: row.get("integration_id"),
            source: row.get("source"),
            tier: tier.parse::<Tier>().map_err(Error::Serialization)?,
            status: serde_json::from_value::<JobStatusDocument>(status)?,
            error_message: row.get("error_message"),
            schedule_interval_secs: row.get("schedule_interval_secs"),
            run_id: row.get("run_id"),
            last_run_started_at: row.get("last_run_started_at"),
            last_run_finished_at: row.get("last_run_finished_at"),
            next_run_at: row.get("next_run_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Job>> {
        rows.into_iter().map(Self::parse_job_row).collect()
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        let status = serde_json::to_value(&job.status)?;
        let result = sqlx::query(
            "INSERT INTO conduit_jobs (id, tenant_id, integration_id, source, tier, status,
                 error_message, schedule_interval_secs, run_id, last_run_started_at,
                 last_run_finished_at, next_run_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (tenant_id, integration_id) DO NOTHING",
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.integration_id)
        .bind(&job.source)
        .bind(job.tier.as_str())
        .bind(status)
        .bind(&job.error_message)
        .bind(job.schedule_interval_secs)
        .bind(job.run_id)
        .bind(job.last_run_started_at)
        .bind(job.last_run_finished_at)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "integration {} already has a job",
                job.integration_id
            )));
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM conduit_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn modify(&self, job_id: Uuid, mutation: JobMutation) -> Result<JobUpdate> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Row lock serializes concurrent transitions on the same job.
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM conduit_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::JobNotFound(job_id))?;

        let mut job = Self::parse_job_row(row)?;
        let changed = mutation(&mut job)?;

        if changed {
            job.updated_at = Utc::now();
            let status = serde_json::to_value(&job.status)?;
            sqlx::query(
                "UPDATE conduit_jobs
                 SET tier = $2, status = $3, error_message = $4, schedule_interval_secs = $5,
                     run_id = $6, last_run_started_at = $7, last_run_finished_at = $8,
                     next_run_at = $9, updated_at = $10
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(job.tier.as_str())
            .bind(status)
            .bind(&job.error_message)
            .bind(job.schedule_interval_secs)
            .bind(job.run_id)
            .bind(job.last_run_started_at)
            .bind(job.last_run_finished_at)
            .bind(job.next_run_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(JobUpdate { job, changed })
    }

    async fn list_by_status(&self, status: OverallStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM conduit_jobs
             WHERE status->>'overall' = $1
             ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM conduit_jobs
             WHERE status->>'overall' = 'READY'
               AND next_run_at IS NOT NULL
               AND next_run_at <= $1
             ORDER BY next_run_at ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }

    async fn list(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM conduit_jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }
}
