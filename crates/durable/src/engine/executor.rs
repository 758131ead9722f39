//! Workflow engine facade
//!
//! The `WorkflowEngine` is responsible for:
//! - Starting new instances
//! - Serializing executions per instance and retrying lost append races
//! - Recording signals and fired timers before resuming
//! - Handing resumes to the queue for out-of-process workers

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::lock::InstanceLocks;
use super::registry::{RegistryError, WorkflowRegistry};
use super::runner::{ExecutionOutcome, Runner, DEFAULT_MAX_EVENTS};
use crate::persistence::{
    HistoryStore, InstanceInfo, InstanceStatus, NewInstance, StoreError,
};
use crate::queue::{QueueError, ResumeQueue};
use crate::reliability::RetryPolicy;
use crate::workflow::{
    signal_names, HistoryEvent, Workflow, WorkflowEvent, WorkflowSignal,
};

/// Configuration for the workflow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum events per instance (for safety)
    pub max_events_per_instance: usize,

    /// Backoff for executions that lose an append race
    pub append_retry: RetryPolicy,

    /// Maximum timers fired per `fire_due_timers` call
    pub timer_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events_per_instance: DEFAULT_MAX_EVENTS,
            append_retry: RetryPolicy::append_conflict(),
            timer_batch_size: 100,
        }
    }
}

impl EngineConfig {
    pub fn with_max_events_per_instance(mut self, max_events: usize) -> Self {
        self.max_events_per_instance = max_events;
        self
    }

    pub fn with_append_retry(mut self, policy: RetryPolicy) -> Self {
        self.append_retry = policy;
        self
    }

    pub fn with_timer_batch_size(mut self, size: usize) -> Self {
        self.timer_batch_size = size.max(1);
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The workflow yielded a command that does not match its history
    #[error(
        "replay divergence in {instance_id} at sequence {sequence}: workflow yielded {expected}, history has {found}"
    )]
    ReplayDivergence {
        instance_id: Uuid,
        sequence: i64,
        expected: String,
        found: String,
    },

    /// The history violates an invariant no workflow could have produced
    #[error("history of {instance_id} is corrupted: {reason}")]
    HistoryCorrupted { instance_id: Uuid, reason: String },

    /// The signal was recorded but the instance will never consume it
    #[error("instance {instance_id} is already {status}")]
    SignalToTerminalInstance {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    /// Firing was requested before the timer's fire time
    #[error("timer {scheduled_sequence} of {instance_id} is not due until {fire_at}")]
    TimerNotDue {
        instance_id: Uuid,
        scheduled_sequence: i64,
        fire_at: chrono::DateTime<chrono::Utc>,
    },

    /// No timer was scheduled at the given sequence
    #[error("no timer scheduled at sequence {scheduled_sequence} of {instance_id}")]
    TimerNotFound {
        instance_id: Uuid,
        scheduled_sequence: i64,
    },

    /// Too many events
    #[error("instance {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// The instance can never make progress again
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ReplayDivergence { .. } | EngineError::HistoryCorrupted { .. }
        )
    }

    /// Executing again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::ConcurrentAppend { .. })
                | EngineError::Store(StoreError::Database(_))
                | EngineError::Queue(QueueError::Database(_))
        )
    }
}

/// Durable workflow engine
///
/// Owns the registry and drives instances through a [`Runner`]. Executions of
/// the same instance are serialized in-process, and each runner pass also
/// holds the history store's lease so engines sharing a store never overlap.
/// Signal appends are optimistic; a pass that loses a race replays.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use waypoint_durable::prelude::*;
///
/// let mut engine = WorkflowEngine::new(
///     Arc::new(InMemoryHistoryStore::new()),
///     Arc::new(InMemoryResumeQueue::new()),
/// );
/// engine.register::<MyWorkflow>();
///
/// let id = engine.run_workflow::<MyWorkflow>(input, None).await?;
/// engine.signal(id, "approved", json!({})).await?;
/// ```
pub struct WorkflowEngine<S: HistoryStore, Q: ResumeQueue> {
    store: Arc<S>,
    queue: Arc<Q>,
    registry: WorkflowRegistry,
    clock: Arc<dyn Clock>,
    locks: InstanceLocks,
    config: EngineConfig,
}

impl<S: HistoryStore, Q: ResumeQueue> WorkflowEngine<S, Q> {
    /// Create an engine with the system clock and default config
    pub fn new(store: Arc<S>, queue: Arc<Q>) -> Self {
        Self {
            store,
            queue,
            registry: WorkflowRegistry::new(),
            clock: Arc::new(SystemClock),
            locks: InstanceLocks::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        debug!(workflow_type = W::TYPE, "registered workflow");
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn runner(&self) -> Runner<'_, S> {
        Runner::new(self.store.as_ref(), &self.registry, self.clock.as_ref())
            .with_max_events(self.config.max_events_per_instance)
    }

    /// Start a new instance and run it until its first suspension
    ///
    /// The business key defaults to the instance id. If the first execution
    /// fails transiently the instance is handed to the resume queue and its
    /// id is still returned.
    #[instrument(skip(self, input), fields(workflow_type = %workflow_type))]
    pub async fn run(
        &self,
        workflow_type: &str,
        input: Value,
        business_key: Option<String>,
    ) -> Result<Uuid, EngineError> {
        // Reject bad input before anything is persisted
        self.registry.create(workflow_type, input.clone())?;

        let instance_id = Uuid::now_v7();
        let business_key = business_key.unwrap_or_else(|| instance_id.to_string());

        self.store
            .create_instance(NewInstance {
                id: instance_id,
                workflow_type: workflow_type.to_string(),
                business_key: business_key.clone(),
                input,
            })
            .await?;

        info!(%instance_id, %business_key, "started workflow");

        match self.execute(instance_id).await {
            Ok(outcome) => {
                debug!(%instance_id, state = ?outcome.state, "first execution finished");
                Ok(instance_id)
            }
            Err(e) if e.is_retryable() => {
                warn!(%instance_id, error = %e, "first execution failed, queueing resume");
                self.queue.enqueue_resume(instance_id).await?;
                Ok(instance_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Typed variant of [`run`](Self::run)
    pub async fn run_workflow<W: Workflow>(
        &self,
        input: W::Input,
        business_key: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let input = serde_json::to_value(input)?;
        self.run(W::TYPE, input, business_key).await
    }

    /// Replay an instance and advance it as far as it can go
    ///
    /// Lost append races are retried with the configured backoff.
    #[instrument(skip(self))]
    pub async fn execute(&self, instance_id: Uuid) -> Result<ExecutionOutcome, EngineError> {
        let policy = &self.config.append_retry;
        let mut attempt = 1;

        loop {
            let result = {
                let _guard = self.locks.acquire(instance_id).await;
                self.runner().execute(instance_id).await
            };
            self.locks.prune();

            match result {
                Err(EngineError::Store(StoreError::ConcurrentAppend {
                    expected, actual, ..
                })) if policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        %instance_id,
                        expected,
                        actual,
                        attempt,
                        ?delay,
                        "lost append race, replaying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Record a signal and resume the instance
    ///
    /// The signal is always recorded. For an instance that already finished
    /// the result is [`EngineError::SignalToTerminalInstance`].
    #[instrument(skip(self, payload), fields(signal = %name))]
    pub async fn signal(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<ExecutionOutcome, EngineError> {
        let signal = WorkflowSignal::at(name, payload, self.clock.now());

        let status = {
            let _guard = self.locks.acquire(instance_id).await;
            let info = self.store.get_instance(instance_id).await?;
            let sequence = self
                .append_with_retry(instance_id, WorkflowEvent::SignalReceived { signal })
                .await?;
            debug!(%instance_id, sequence, "signal recorded");
            info.status
        };

        if status.is_terminal() {
            warn!(%instance_id, %status, "signal sent to finished instance");
            return Err(EngineError::SignalToTerminalInstance {
                instance_id,
                status,
            });
        }

        self.execute(instance_id).await
    }

    /// Deliver the reserved cancellation signal
    pub async fn cancel(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.signal(instance_id, signal_names::CANCEL, json!({ "reason": reason }))
            .await
    }

    /// Fire the timer scheduled at `scheduled_sequence` and resume
    ///
    /// Firing an already fired timer only resumes the instance. A finished
    /// instance is returned as it is and nothing is recorded.
    #[instrument(skip(self))]
    pub async fn fire_timer(
        &self,
        instance_id: Uuid,
        scheduled_sequence: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        {
            let _guard = self.locks.acquire(instance_id).await;
            let info = self.store.get_instance(instance_id).await?;
            if info.status.is_terminal() {
                debug!(%instance_id, scheduled_sequence, status = %info.status, "timer on finished instance ignored");
                return Ok(ExecutionOutcome::from_terminal(&info));
            }
            let history = self.store.load_history(instance_id).await?;

            let fire_at = usize::try_from(scheduled_sequence)
                .ok()
                .and_then(|index| history.get(index))
                .and_then(|event| match event.event {
                    WorkflowEvent::TimerScheduled { fire_at, .. } => Some(fire_at),
                    _ => None,
                })
                .ok_or(EngineError::TimerNotFound {
                    instance_id,
                    scheduled_sequence,
                })?;

            let already_fired = history.iter().any(|event| {
                matches!(
                    event.event,
                    WorkflowEvent::TimerFired { scheduled_sequence: s, .. } if s == scheduled_sequence
                )
            });

            if already_fired {
                debug!(%instance_id, scheduled_sequence, "timer already fired");
            } else {
                let now = self.clock.now();
                if now < fire_at {
                    return Err(EngineError::TimerNotDue {
                        instance_id,
                        scheduled_sequence,
                        fire_at,
                    });
                }

                let event = WorkflowEvent::TimerFired {
                    scheduled_sequence,
                    fired_at: now,
                };
                self.store
                    .append_events(instance_id, history.len() as i64, vec![event])
                    .await?;
                info!(%instance_id, scheduled_sequence, "timer fired");
            }
        }

        self.execute(instance_id).await
    }

    /// Fire every timer due at the current clock time
    ///
    /// Failures are logged per instance and do not stop the batch. Returns
    /// how many timers were fired and resumed successfully.
    pub async fn fire_due_timers(&self) -> Result<usize, EngineError> {
        let due = self
            .store
            .due_timers(self.clock.now(), self.config.timer_batch_size)
            .await?;

        let mut fired = 0;
        for timer in due {
            match self
                .fire_timer(timer.instance_id, timer.scheduled_sequence)
                .await
            {
                Ok(_) => fired += 1,
                Err(e) if e.is_fatal() => {
                    error!(instance_id = %timer.instance_id, error = %e, "instance failed while firing timer");
                }
                Err(e) => {
                    warn!(instance_id = %timer.instance_id, error = %e, "failed to fire timer");
                }
            }
        }

        if fired > 0 {
            debug!(fired, "fired due timers");
        }
        Ok(fired)
    }

    /// Ask a worker to execute the instance
    pub async fn resume(&self, instance_id: Uuid) -> Result<Uuid, EngineError> {
        let task_id = self.queue.enqueue_resume(instance_id).await?;
        debug!(%instance_id, %task_id, "resume queued");
        Ok(task_id)
    }

    pub async fn instance(&self, instance_id: Uuid) -> Result<InstanceInfo, EngineError> {
        Ok(self.store.get_instance(instance_id).await?)
    }

    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<HistoryEvent>, EngineError> {
        Ok(self.store.load_history(instance_id).await?)
    }

    pub async fn find_by_business_key(
        &self,
        workflow_type: &str,
        business_key: &str,
    ) -> Result<Option<InstanceInfo>, EngineError> {
        Ok(self
            .store
            .find_by_business_key(workflow_type, business_key)
            .await?)
    }

    /// Append at the current end of the history, retrying lost races
    async fn append_with_retry(
        &self,
        instance_id: Uuid,
        event: WorkflowEvent,
    ) -> Result<i64, EngineError> {
        let policy = &self.config.append_retry;
        let mut attempt = 1;

        loop {
            let expected = self.store.event_count(instance_id).await?;
            match self
                .store
                .append_events(instance_id, expected, vec![event.clone()])
                .await
            {
                Err(StoreError::ConcurrentAppend { .. }) if policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
                other => return other.map(|next| next - 1).map_err(Into::into),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryHistoryStore;
    use crate::queue::InMemoryResumeQueue;
    use crate::workflow::{Resume, Step, WorkflowError};

    struct WaitForGo;

    impl Workflow for WaitForGo {
        const TYPE: &'static str = "wait_for_go";
        type Input = ();
        type Output = String;

        fn new(_: ()) -> Self {
            Self
        }

        fn on_start(&mut self) -> Step<String> {
            Step::await_signal()
        }

        fn on_resume(&mut self, resume: Resume) -> Step<String> {
            match resume.into_signal() {
                Some(signal) if signal.is_cancel() => {
                    Step::Fail(WorkflowError::cancelled("stopped"))
                }
                Some(signal) => Step::Complete(signal.name),
                None => Step::Fail(WorkflowError::new("expected a signal")),
            }
        }
    }

    fn engine() -> WorkflowEngine<InMemoryHistoryStore, InMemoryResumeQueue> {
        let mut engine = WorkflowEngine::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(InMemoryResumeQueue::new()),
        );
        engine.register::<WaitForGo>();
        engine
    }

    #[test]
    fn test_error_classification() {
        let id = Uuid::now_v7();
        let conflict = EngineError::Store(StoreError::ConcurrentAppend {
            instance_id: id,
            expected: 1,
            actual: 2,
        });
        assert!(conflict.is_retryable());
        assert!(!conflict.is_fatal());

        let divergence = EngineError::ReplayDivergence {
            instance_id: id,
            sequence: 1,
            expected: "timer(10ms)".into(),
            found: "side_effect_recorded(charge)".into(),
        };
        assert!(divergence.is_fatal());
        assert!(!divergence.is_retryable());

        let missing = EngineError::Store(StoreError::InstanceNotFound(id));
        assert!(!missing.is_fatal());
        assert!(!missing.is_retryable());
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_type() {
        let engine = engine();
        let err = engine.run("nope", Value::Null, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Registry(RegistryError::UnknownWorkflowType(_))
        ));
    }

    #[tokio::test]
    async fn test_run_rejects_bad_input_without_persisting() {
        let engine = engine();
        let err = engine
            .run(WaitForGo::TYPE, json!({ "unexpected": true }), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Registry(RegistryError::Deserialization(_))
        ));
        assert_eq!(engine.store().instance_count(), 0);
    }

    #[tokio::test]
    async fn test_business_key_defaults_to_id() {
        let engine = engine();
        let id = engine.run_workflow::<WaitForGo>((), None).await.unwrap();

        let info = engine.instance(id).await.unwrap();
        assert_eq!(info.business_key, id.to_string());
        assert_eq!(info.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_signal_and_cancel() {
        let engine = engine();

        let first = engine.run_workflow::<WaitForGo>((), None).await.unwrap();
        let outcome = engine.signal(first, "go", json!({})).await.unwrap();
        assert_eq!(outcome.result(), Some(&json!("go")));

        let second = engine.run_workflow::<WaitForGo>((), None).await.unwrap();
        let outcome = engine.cancel(second, "no longer needed").await.unwrap();
        assert!(outcome
            .error()
            .unwrap()
            .has_code(crate::workflow::error_codes::CANCELLED));
    }

    #[tokio::test]
    async fn test_fire_timer_unknown_sequence() {
        let engine = engine();
        let id = engine.run_workflow::<WaitForGo>((), None).await.unwrap();

        let err = engine.fire_timer(id, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::TimerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_resume_enqueues() {
        let engine = engine();
        let id = engine.run_workflow::<WaitForGo>((), None).await.unwrap();

        engine.resume(id).await.unwrap();
        assert_eq!(engine.queue().pending_count(), 1);
    }
}
