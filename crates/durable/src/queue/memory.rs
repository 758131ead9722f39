//! In-memory implementation of ResumeQueue for testing

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{NackOutcome, QueueError, ResumeQueue, ResumeTask};
use crate::reliability::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Claimed {
        worker_id: String,
        claimed_at: DateTime<Utc>,
    },
    Dead,
}

struct TaskState {
    task: ResumeTask,
    status: TaskStatus,
    visible_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// In-memory implementation of ResumeQueue
///
/// Tasks are keyed by UUID v7, so iteration order is enqueue order.
pub struct InMemoryResumeQueue {
    tasks: Mutex<BTreeMap<Uuid, TaskState>>,
    retry_policy: RetryPolicy,
}

impl InMemoryResumeQueue {
    /// Create a queue with the default redelivery policy
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::exponential())
    }

    /// Create a queue with a custom redelivery policy
    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            retry_policy,
        }
    }

    /// Number of tasks waiting to be claimed
    pub fn pending_count(&self) -> usize {
        self.count(|s| *s == TaskStatus::Pending)
    }

    /// Number of tasks that ran out of attempts
    pub fn dead_count(&self) -> usize {
        self.count(|s| *s == TaskStatus::Dead)
    }

    /// Last error recorded for a task
    pub fn last_error(&self, task_id: Uuid) -> Option<String> {
        self.tasks
            .lock()
            .get(&task_id)
            .and_then(|t| t.last_error.clone())
    }

    fn count(&self, predicate: impl Fn(&TaskStatus) -> bool) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|t| predicate(&t.status))
            .count()
    }
}

impl Default for InMemoryResumeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResumeQueue for InMemoryResumeQueue {
    async fn enqueue_resume(&self, instance_id: Uuid) -> Result<Uuid, QueueError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        self.tasks.lock().insert(
            id,
            TaskState {
                task: ResumeTask {
                    id,
                    instance_id,
                    attempt: 0,
                    enqueued_at: now,
                },
                status: TaskStatus::Pending,
                visible_at: now,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ResumeTask>, QueueError> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock();

        let claimed = tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Pending && t.visible_at <= now)
            .take(max_tasks)
            .map(|t| {
                t.status = TaskStatus::Claimed {
                    worker_id: worker_id.to_string(),
                    claimed_at: now,
                };
                t.task.attempt += 1;
                t.task.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn ack(&self, task_id: Uuid) -> Result<(), QueueError> {
        self.tasks
            .lock()
            .remove(&task_id)
            .map(|_| ())
            .ok_or(QueueError::TaskNotFound(task_id))
    }

    async fn nack(&self, task_id: Uuid, error: &str) -> Result<NackOutcome, QueueError> {
        let mut tasks = self.tasks.lock();
        let state = tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;

        state.last_error = Some(error.to_string());

        if self.retry_policy.has_attempts_remaining(state.task.attempt) {
            let next_attempt = state.task.attempt + 1;
            let delay = self.retry_policy.delay_for_attempt(next_attempt);
            state.status = TaskStatus::Pending;
            state.visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            Ok(NackOutcome::Requeued {
                next_attempt,
                delay,
            })
        } else {
            state.status = TaskStatus::Dead;
            Ok(NackOutcome::Dead)
        }
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut reclaimed = 0;

        for state in self.tasks.lock().values_mut() {
            if matches!(&state.status, TaskStatus::Claimed { claimed_at, .. } if *claimed_at < cutoff)
            {
                state.status = TaskStatus::Pending;
                state.visible_at = Utc::now();
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }
}
