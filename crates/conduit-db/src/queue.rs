//! Postgres-backed queue broker.
//!
//! All twelve tier-scoped queues live in `pipeline_queue`, distinguished by
//! `queue_name`. Consumers claim with `FOR UPDATE SKIP LOCKED`, so any number
//! of workers (in any number of processes) can drain the same queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use conduit_core::{Delivery, Envelope, Error, QueueBroker, QueueDepth, QueueId, Result};

/// PostgreSQL implementation of QueueBroker.
pub struct PgQueueBroker {
    pool: Pool<Postgres>,
    /// Local wake handles, one per queue. Consumers in other processes fall
    /// back to their poll interval.
    notifiers: HashMap<QueueId, Arc<Notify>>,
}

impl PgQueueBroker {
    pub fn new(pool: Pool<Postgres>) -> Self {
        let notifiers = QueueId::all()
            .into_iter()
            .map(|q| (q, Arc::new(Notify::new())))
            .collect();
        Self { pool, notifiers }
    }

    /// Return in-flight messages claimed longer than `older_than` ago to the
    /// ready state. Run at startup to recover deliveries held by a crashed
    /// process.
    pub async fn recover_in_flight(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE pipeline_queue SET status = 'ready', claimed_at = NULL
             WHERE status = 'in_flight' AND claimed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(
                subsystem = "queue",
                component = "pg_broker",
                op = "recover_in_flight",
                recovered,
                "Requeued stale in-flight messages"
            );
            for notify in self.notifiers.values() {
                notify.notify_waiters();
            }
        }
        Ok(recovered)
    }
}

#[async_trait]
impl QueueBroker for PgQueueBroker {
    async fn publish(&self, queue: QueueId, envelope: Envelope) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let body = serde_json::to_value(&envelope)?;
        sqlx::query(
            "INSERT INTO pipeline_queue (id, queue_name, envelope, status, attempts, created_at)
             VALUES ($1, $2, $3, 'ready', 0, $4)",
        )
        .bind(id)
        .bind(queue.name())
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Queue(format!("publish to {} failed: {}", queue, e)))?;

        debug!(subsystem = "queue", queue = %queue, message_id = %id, "Published");
        self.notifier(queue).notify_one();
        Ok(id)
    }

    async fn receive(&self, queue: QueueId) -> Result<Option<Delivery>> {
        let row = sqlx::query(
            "UPDATE pipeline_queue
             SET status = 'in_flight', attempts = attempts + 1, claimed_at = $2
             WHERE id = (
                 SELECT id FROM pipeline_queue
                 WHERE queue_name = $1 AND status = 'ready'
                 ORDER BY seq ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, envelope, attempts",
        )
        .bind(queue.name())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Queue(format!("receive from {} failed: {}", queue, e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_value(row.get("envelope"))?;
        let attempts: i32 = row.get("attempts");
        Ok(Some(Delivery {
            id: row.get("id"),
            queue,
            envelope,
            attempts: attempts.max(0) as u32,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_queue WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Queue(format!("ack {} failed: {}", delivery.id, e)))?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let query = if requeue {
            "UPDATE pipeline_queue SET status = 'ready', claimed_at = NULL WHERE id = $1"
        } else {
            "DELETE FROM pipeline_queue WHERE id = $1"
        };
        sqlx::query(query)
            .bind(delivery.id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Queue(format!("nack {} failed: {}", delivery.id, e)))?;
        if requeue {
            self.notifier(delivery.queue).notify_one();
        }
        Ok(())
    }

    async fn depth(&self, queue: QueueId) -> Result<QueueDepth> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE status = 'ready') AS ready,
                 COUNT(*) FILTER (WHERE status = 'in_flight') AS in_flight
             FROM pipeline_queue WHERE queue_name = $1",
        )
        .bind(queue.name())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let ready: i64 = row.get("ready");
        let in_flight: i64 = row.get("in_flight");
        Ok(QueueDepth {
            queue,
            ready: ready.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
        })
    }

    fn notifier(&self, queue: QueueId) -> Arc<Notify> {
        self.notifiers
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }
}
