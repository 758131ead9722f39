//! PostgreSQL implementation of ResumeQueue

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{NackOutcome, QueueError, ResumeQueue, ResumeTask};
use crate::reliability::RetryPolicy;

/// PostgreSQL implementation of ResumeQueue
///
/// Claims with `FOR UPDATE SKIP LOCKED` so many workers can poll the same
/// table without contention. Shares its schema with
/// [`PostgresHistoryStore`](crate::PostgresHistoryStore).
#[derive(Clone)]
pub struct PostgresResumeQueue {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PostgresResumeQueue {
    /// Create a queue with the default redelivery policy
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::exponential(),
        }
    }

    /// Set the redelivery policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

fn db_error(e: sqlx::Error) -> QueueError {
    QueueError::Database(e.to_string())
}

#[async_trait]
impl ResumeQueue for PostgresResumeQueue {
    #[instrument(skip(self))]
    async fn enqueue_resume(&self, instance_id: Uuid) -> Result<Uuid, QueueError> {
        let task_id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO durable_resume_queue (id, instance_id, max_attempts)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(task_id)
        .bind(instance_id)
        .bind(self.retry_policy.max_attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue resume task: {}", e);
            db_error(e)
        })?;

        debug!(%task_id, %instance_id, "enqueued resume task");
        Ok(task_id)
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ResumeTask>, QueueError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM durable_resume_queue
                WHERE status = 'pending'
                  AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_resume_queue q
            SET status = 'claimed',
                claimed_by = $2,
                claimed_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE q.id = c.id
            RETURNING q.id, q.instance_id, q.attempt, q.enqueued_at
            "#,
        )
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim resume tasks: {}", e);
            db_error(e)
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push(ResumeTask {
                id: row.try_get("id").map_err(db_error)?,
                instance_id: row.try_get("instance_id").map_err(db_error)?,
                attempt: row.try_get::<i32, _>("attempt").map_err(db_error)? as u32,
                enqueued_at: row.try_get("enqueued_at").map_err(db_error)?,
            });
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed resume tasks");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn ack(&self, task_id: Uuid) -> Result<(), QueueError> {
        let deleted = sqlx::query("DELETE FROM durable_resume_queue WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if deleted.rows_affected() == 0 {
            return Err(QueueError::TaskNotFound(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn nack(&self, task_id: Uuid, error: &str) -> Result<NackOutcome, QueueError> {
        let row = sqlx::query("SELECT attempt, max_attempts FROM durable_resume_queue WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or(QueueError::TaskNotFound(task_id))?;

        let attempt = row.try_get::<i32, _>("attempt").map_err(db_error)? as u32;
        let max_attempts = row.try_get::<i32, _>("max_attempts").map_err(db_error)? as u32;

        if attempt < max_attempts {
            let next_attempt = attempt + 1;
            let delay = self.retry_policy.delay_for_attempt(next_attempt);
            let visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE durable_resume_queue
                SET status = 'pending',
                    claimed_by = NULL,
                    claimed_at = NULL,
                    last_error = $2,
                    visible_at = $3
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(error)
            .bind(visible_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            debug!(%task_id, next_attempt, "resume task will be redelivered");
            Ok(NackOutcome::Requeued {
                next_attempt,
                delay,
            })
        } else {
            sqlx::query(
                r#"
                UPDATE durable_resume_queue
                SET status = 'dead',
                    last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            debug!(%task_id, "resume task is dead");
            Ok(NackOutcome::Dead)
        }
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let updated = sqlx::query(
            r#"
            UPDATE durable_resume_queue
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                visible_at = NOW()
            WHERE status = 'claimed'
              AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(updated.rows_affected() as usize)
    }
}
