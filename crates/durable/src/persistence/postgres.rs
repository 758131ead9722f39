//! PostgreSQL implementation of HistoryStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via sequence numbers
//! - Optional `(workflow_type, business_key)` uniqueness, via a partial unique index
//! - Transaction-scoped advisory locks as instance leases
//! - Streaming history reads for replay

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// PostgreSQL implementation of HistoryStore
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::PostgresHistoryStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresHistoryStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
    unique_business_keys: bool,
}

/// Lease held as `pg_advisory_xact_lock` inside an open transaction
struct AdvisoryLease {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl InstanceLease for AdvisoryLease {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_error)
    }
}

/// Advisory lock key for an instance
fn advisory_key(instance_id: Uuid) -> i64 {
    let (high, low) = instance_id.as_u64_pair();
    (high ^ low) as i64
}

impl PostgresHistoryStore {
    /// Create a new PostgreSQL store with unique business keys
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            unique_business_keys: true,
        }
    }

    /// Enable or disable the business key uniqueness constraint
    ///
    /// Instances created with uniqueness disabled are not checked against,
    /// and do not block, later instances with the same key.
    pub fn with_unique_business_keys(mut self, unique: bool) -> Self {
        self.unique_business_keys = unique;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn create_instance(&self, instance: NewInstance) -> Result<InstanceInfo, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(
            r#"
            INSERT INTO durable_workflow_instances
                (id, workflow_type, business_key, unique_business_key, status, input)
            VALUES ($1, $2, $3, $4, 'running', $5)
            RETURNING id, workflow_type, business_key, status, input, result, error,
                      created_at, updated_at
            "#,
        )
        .bind(instance.id)
        .bind(&instance.workflow_type)
        .bind(&instance.business_key)
        .bind(self.unique_business_keys)
        .bind(&instance.input)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateBusinessKey {
                    workflow_type: instance.workflow_type.clone(),
                    business_key: instance.business_key.clone(),
                }
            }
            _ => {
                error!("Failed to create instance: {}", e);
                StoreError::Database(e.to_string())
            }
        })?;

        let started = WorkflowEvent::Started {
            input: instance.input.clone(),
        };
        sqlx::query(
            r#"
            INSERT INTO durable_history_events (instance_id, sequence, event_type, event_data)
            VALUES ($1, 0, $2, $3)
            "#,
        )
        .bind(instance.id)
        .bind(started.kind().as_str())
        .bind(serde_json::to_value(&started)?)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(workflow_type = %instance.workflow_type, "created instance");
        instance_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn lock_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Box<dyn InstanceLease>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(instance_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to lock instance: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(Box::new(AdvisoryLease { tx }))
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, business_key, status, input, result, error,
                   created_at, updated_at
            FROM durable_workflow_instances
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get instance: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_by_business_key(
        &self,
        workflow_type: &str,
        business_key: &str,
    ) -> Result<Option<InstanceInfo>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, business_key, status, input, result, error,
                   created_at, updated_at
            FROM durable_workflow_instances
            WHERE workflow_type = $1 AND business_key = $2
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(workflow_type)
        .bind(business_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find instance by business key: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        instance_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Serialize appenders on the instance row
        sqlx::query("SELECT id FROM durable_workflow_instances WHERE id = $1 FOR UPDATE")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence) + 1, 0) AS next_seq
            FROM durable_history_events
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let actual: i64 = row
            .try_get("next_seq")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if actual != expected_sequence {
            return Err(StoreError::ConcurrentAppend {
                instance_id,
                expected: expected_sequence,
                actual,
            });
        }

        let mut sequence = actual;
        for event in events {
            let fire_at = match &event {
                WorkflowEvent::TimerScheduled { fire_at, .. } => Some(*fire_at),
                _ => None,
            };
            let event_data = serde_json::to_value(&event)?;

            sqlx::query(
                r#"
                INSERT INTO durable_history_events
                    (instance_id, sequence, event_type, event_data, fire_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(instance_id)
            .bind(sequence)
            .bind(event.kind().as_str())
            .bind(&event_data)
            .bind(fire_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::ConcurrentAppend {
                        instance_id,
                        expected: expected_sequence,
                        actual: sequence + 1,
                    }
                }
                _ => StoreError::Database(e.to_string()),
            })?;

            sequence += 1;
        }

        sqlx::query("UPDATE durable_workflow_instances SET updated_at = NOW() WHERE id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%instance_id, next_sequence = sequence, "appended events");
        Ok(sequence)
    }

    fn load_events(&self, instance_id: Uuid) -> EventStream<'_> {
        sqlx::query(
            r#"
            SELECT sequence, recorded_at, event_data
            FROM durable_history_events
            WHERE instance_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(instance_id)
        .fetch(&self.pool)
        .map(move |row| {
            let row = row.map_err(|e| {
                error!("Failed to load events: {}", e);
                StoreError::Database(e.to_string())
            })?;
            event_from_row(instance_id, &row)
        })
        .boxed()
    }

    #[instrument(skip(self))]
    async fn event_count(&self, instance_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM durable_history_events WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.try_get("count")
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    #[instrument(skip(self, result, error))]
    async fn update_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error.map(|e| serde_json::to_value(&e)).transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE durable_workflow_instances
            SET status = $2, result = $3, error = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error_json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update instance status: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueTimer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.instance_id, s.sequence, s.fire_at
            FROM durable_history_events s
            JOIN durable_workflow_instances i ON i.id = s.instance_id
            WHERE s.event_type = 'timer_scheduled'
              AND i.status = 'running'
              AND s.fire_at <= $1
              AND NOT EXISTS (
                  SELECT 1
                  FROM durable_history_events f
                  WHERE f.instance_id = s.instance_id
                    AND f.event_type = 'timer_fired'
                    AND (f.event_data->>'scheduled_sequence')::BIGINT = s.sequence
              )
            ORDER BY s.fire_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to query due timers: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter()
            .map(|row| {
                Ok(DueTimer {
                    instance_id: row.try_get("instance_id").map_err(db_error)?,
                    scheduled_sequence: row.try_get("sequence").map_err(db_error)?,
                    fire_at: row.try_get("fire_at").map_err(db_error)?,
                })
            })
            .collect()
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn instance_from_row(row: &PgRow) -> Result<InstanceInfo, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    let error_json: Option<serde_json::Value> = row.try_get("error").map_err(db_error)?;

    Ok(InstanceInfo {
        id: row.try_get("id").map_err(db_error)?,
        business_key: row.try_get("business_key").map_err(db_error)?,
        workflow_type: row.try_get("workflow_type").map_err(db_error)?,
        status: status.parse()?,
        input: row.try_get("input").map_err(db_error)?,
        result: row.try_get("result").map_err(db_error)?,
        error: error_json.map(serde_json::from_value).transpose()?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn event_from_row(instance_id: Uuid, row: &PgRow) -> Result<HistoryEvent, StoreError> {
    let data: serde_json::Value = row.try_get("event_data").map_err(db_error)?;

    Ok(HistoryEvent {
        instance_id,
        sequence: row.try_get("sequence").map_err(db_error)?,
        recorded_at: row.try_get("recorded_at").map_err(db_error)?,
        event: serde_json::from_value(data)?,
    })
}
