//! Resume worker
//!
//! Claims resume tasks and executes the referenced instances with bounded
//! concurrency. Handles redelivery, stale-claim reclamation and graceful
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::duration_millis;
use super::poller::{PollerConfig, QueuePoller};
use crate::engine::WorkflowEngine;
use crate::persistence::HistoryStore;
use crate::queue::{NackOutcome, ResumeQueue, ResumeTask};

/// Resume worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeWorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Stale claim reclamation interval
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,

    /// How long a claim may go unacknowledged before redelivery
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ResumeWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ResumeWorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Claiming and executing tasks
    Running,
    /// Finishing in-flight executions, not claiming new ones
    Draining,
    Stopped,
}

/// Resume worker errors
#[derive(Debug, thiserror::Error)]
pub enum ResumeWorkerError {
    /// Worker already running
    #[error("resume worker is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} executions in flight")]
    ShutdownTimeout(usize),
}

/// Executes queued resumes against a [`WorkflowEngine`]
///
/// Delivery is at-least-once: a task is acknowledged only after its
/// execution returns, so a crash mid-execution leads to a redelivery and a
/// harmless replay.
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::worker::{ResumeWorker, ResumeWorkerConfig};
///
/// let worker = ResumeWorker::new(engine.clone(), ResumeWorkerConfig::new().with_max_concurrency(20));
/// worker.start()?;
///
/// // ... later, graceful shutdown
/// worker.shutdown().await?;
/// ```
pub struct ResumeWorker<S: HistoryStore, Q: ResumeQueue> {
    engine: Arc<WorkflowEngine<S, Q>>,
    config: ResumeWorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerStatus>,
    active_tasks: Arc<Semaphore>,
    tracker: TaskTracker,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: HistoryStore, Q: ResumeQueue> ResumeWorker<S, Q> {
    pub fn new(engine: Arc<WorkflowEngine<S, Q>>, config: ResumeWorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            engine,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerStatus::Stopped),
            tracker: TaskTracker::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Start the poll and reclaim loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), ResumeWorkerError> {
        {
            let mut status = self.status.write();
            if *status != WorkerStatus::Stopped {
                return Err(ResumeWorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        // Restart after a previous shutdown
        self.shutdown_tx.send_replace(false);
        self.tracker.reopen();

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "Starting resume worker"
        );

        let poll = self.start_poll_loop();
        let reclaim = self.start_reclaim_loop();
        self.loops.lock().extend([poll, reclaim]);

        Ok(())
    }

    /// Stop claiming and wait for in-flight executions
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), ResumeWorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerStatus::Stopped {
                return Ok(());
            }
            *status = WorkerStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!("Worker loop ended abnormally: {}", e);
            }
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            let in_flight = self.in_flight();
            warn!(in_flight, "Shutdown timeout reached");
            return Err(ResumeWorkerError::ShutdownTimeout(in_flight));
        }

        *self.status.write() = WorkerStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Resume worker stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Executions currently running
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    fn start_poll_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let config = self.config.clone();
        let active_tasks = Arc::clone(&self.active_tasks);
        let tracker = self.tracker.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut poller = QueuePoller::new(
                Arc::clone(engine.queue()),
                config.worker_id.clone(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_tasks.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(tasks) => {
                        for task in tasks {
                            // Claimed up to the free permits, so this only fails on close
                            let permit = match Arc::clone(&active_tasks).try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    let _ = engine.queue().nack(task.id, "worker at capacity").await;
                                    continue;
                                }
                            };

                            let engine = Arc::clone(&engine);
                            tracker.spawn(async move {
                                process_task(&engine, task).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        })
    }

    fn start_reclaim_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(self.engine.queue());
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.reclaim_stale(threshold).await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "Reclaimed stale resume tasks"),
                            Err(e) => error!("Stale task reclamation failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        })
    }
}

/// Execute one claimed task and settle it with the queue
#[instrument(skip_all, fields(task_id = %task.id, instance_id = %task.instance_id, attempt = task.attempt))]
async fn process_task<S: HistoryStore, Q: ResumeQueue>(
    engine: &WorkflowEngine<S, Q>,
    task: ResumeTask,
) {
    let queue = engine.queue();

    match engine.execute(task.instance_id).await {
        Ok(outcome) => {
            debug!(state = ?outcome.state, "Resume executed");
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "Resume failed, requeueing");
            match queue.nack(task.id, &e.to_string()).await {
                Ok(NackOutcome::Requeued { next_attempt, delay }) => {
                    debug!(next_attempt, ?delay, "Resume task requeued");
                }
                Ok(NackOutcome::Dead) => {
                    error!(error = %e, "Resume task out of attempts");
                }
                Err(nack_err) => error!("Failed to nack resume task: {}", nack_err),
            }
            return;
        }
        Err(e) if e.is_fatal() => {
            // Already recorded as a failed instance; redelivery cannot help
            error!(error = %e, "Instance failed permanently");
        }
        Err(e) => {
            warn!(error = %e, "Resume dropped");
        }
    }

    if let Err(e) = queue.ack(task.id).await {
        error!("Failed to ack resume task: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryHistoryStore;
    use crate::queue::InMemoryResumeQueue;

    #[test]
    fn test_default_config() {
        let config = ResumeWorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder() {
        let config = ResumeWorkerConfig::new()
            .with_worker_id("resume-1")
            .with_max_concurrency(0)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.worker_id, "resume-1");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown() {
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(InMemoryResumeQueue::new()),
        ));
        let worker = ResumeWorker::new(engine, ResumeWorkerConfig::new());

        assert_eq!(worker.status(), WorkerStatus::Stopped);
        worker.start().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert!(matches!(
            worker.start(),
            Err(ResumeWorkerError::AlreadyRunning)
        ));

        worker.shutdown().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_acked() {
        let queue = Arc::new(InMemoryResumeQueue::new());
        let engine = WorkflowEngine::new(Arc::new(InMemoryHistoryStore::new()), queue.clone());

        queue.enqueue_resume(Uuid::now_v7()).await.unwrap();
        let task = queue.claim("w1", 1).await.unwrap().remove(0);

        process_task(&engine, task).await;
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.dead_count(), 0);
    }
}
