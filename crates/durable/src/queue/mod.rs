//! Resume queue
//!
//! At-least-once delivery of "resume instance X" tasks. The runner is safe to
//! invoke redundantly, so duplicate deliveries only cost a replay.
//!
//! This module provides:
//! - [`ResumeQueue`] trait
//! - [`InMemoryResumeQueue`] for testing and embedding
//! - [`PostgresResumeQueue`] for production (`FOR UPDATE SKIP LOCKED` claiming)

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::InMemoryResumeQueue;
pub use postgres::PostgresResumeQueue;

/// A claimed resume task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// What happened to a negatively acknowledged task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Redelivered after `delay`
    Requeued { next_attempt: u32, delay: Duration },
    /// Out of attempts; kept for inspection, never redelivered
    Dead,
}

/// Errors from queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Task not found (already acknowledged or never enqueued)
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

/// At-least-once queue of resume tasks
#[async_trait]
pub trait ResumeQueue: Send + Sync + 'static {
    /// Enqueue a resume request for an instance
    async fn enqueue_resume(&self, instance_id: Uuid) -> Result<Uuid, QueueError>;

    /// Claim up to `max_tasks` visible tasks for a worker
    async fn claim(&self, worker_id: &str, max_tasks: usize)
        -> Result<Vec<ResumeTask>, QueueError>;

    /// Acknowledge a task; it will not be delivered again
    async fn ack(&self, task_id: Uuid) -> Result<(), QueueError>;

    /// Return a task for redelivery with backoff, or bury it
    async fn nack(&self, task_id: Uuid, error: &str) -> Result<NackOutcome, QueueError>;

    /// Make tasks claimed longer than `older_than` ago visible again
    ///
    /// Covers workers that died between claim and ack.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, QueueError>;
}
