//! Replay and live execution of a single instance
//!
//! A [`Runner`] rebuilds a workflow from its history and drives it forward:
//!
//! 1. **Replay.** Every command the workflow yields is matched against the
//!    next recorded event and resumed with the recorded outcome. Side-effect
//!    callbacks are not invoked.
//! 2. **Live.** Once the history is exhausted, side effects run and their
//!    outcomes are appended, timers are scheduled, and the runner stops at
//!    the first timer or signal wait.
//!
//! A command that does not match its recorded event is a replay divergence.
//! Divergence and corrupted histories are fatal: the instance is marked
//! failed and never retried.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::executor::EngineError;
use super::registry::{AnyWorkflow, WorkflowRegistry};
use crate::persistence::{EventStream, HistoryStore, InstanceInfo, InstanceStatus};
use crate::workflow::{
    error_codes, Command, HistoryEvent, Resume, SignalDisposition, Step, WorkflowError,
    WorkflowEvent, WorkflowSignal,
};

/// Default ceiling on events per instance
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// What a suspended instance is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitingOn {
    Timer { fire_at: DateTime<Utc> },
    Signal,
}

/// Where an execution left the instance
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionState {
    /// Waiting; `sequence` is the last event in the history
    Suspended { sequence: i64, waiting_on: WaitingOn },
    Completed { result: Value },
    Failed { error: WorkflowError },
}

/// Result of one runner invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub instance_id: Uuid,
    pub state: ExecutionState,
    /// Events read from the store
    pub events_replayed: usize,
    /// Events appended by this invocation
    pub events_written: usize,
}

impl ExecutionOutcome {
    /// Outcome for an instance that already finished
    pub(crate) fn from_terminal(info: &InstanceInfo) -> Self {
        let state = match info.status {
            InstanceStatus::Completed => ExecutionState::Completed {
                result: info.result.clone().unwrap_or(Value::Null),
            },
            _ => ExecutionState::Failed {
                error: info
                    .error
                    .clone()
                    .unwrap_or_else(|| WorkflowError::new("instance failed")),
            },
        };

        Self {
            instance_id: info.id,
            state,
            events_replayed: 0,
            events_written: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, ExecutionState::Suspended { .. })
    }

    /// Completion value, if the instance completed
    pub fn result(&self) -> Option<&Value> {
        match &self.state {
            ExecutionState::Completed { result } => Some(result),
            _ => None,
        }
    }

    /// Failure, if the instance failed
    pub fn error(&self) -> Option<&WorkflowError> {
        match &self.state {
            ExecutionState::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn waiting_on(&self) -> Option<&WaitingOn> {
        match &self.state {
            ExecutionState::Suspended { waiting_on, .. } => Some(waiting_on),
            _ => None,
        }
    }
}

/// Drives one instance from its history
///
/// The runner holds no state between invocations. Each pass holds the
/// store's lease on the instance, so passes from any engine sharing the
/// store never overlap and a live side effect is reached by one pass only.
pub struct Runner<'a, S: HistoryStore> {
    store: &'a S,
    registry: &'a WorkflowRegistry,
    clock: &'a dyn Clock,
    max_events: usize,
}

impl<'a, S: HistoryStore> Runner<'a, S> {
    pub fn new(store: &'a S, registry: &'a WorkflowRegistry, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            registry,
            clock,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Replay the instance and advance it as far as it can go
    #[instrument(skip(self), fields(%instance_id))]
    pub async fn execute(&self, instance_id: Uuid) -> Result<ExecutionOutcome, EngineError> {
        let lease = self.store.lock_instance(instance_id).await?;
        let result = self.execute_leased(instance_id).await;
        if let Err(e) = lease.release().await {
            warn!(error = %e, "failed to release instance lease");
        }
        result
    }

    async fn execute_leased(&self, instance_id: Uuid) -> Result<ExecutionOutcome, EngineError> {
        let info = self.store.get_instance(instance_id).await?;
        if info.status.is_terminal() {
            debug!(status = %info.status, "instance already finished");
            return Ok(ExecutionOutcome::from_terminal(&info));
        }

        let mut cursor = HistoryCursor::new(instance_id, self.store.load_events(instance_id));
        let result = self.drive(&info, &mut cursor).await;
        drop(cursor);

        match result {
            Err(e) if e.is_fatal() => {
                self.fail_instance(instance_id, &e).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn drive(
        &self,
        info: &InstanceInfo,
        cursor: &mut HistoryCursor<'_>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let id = info.id;

        let input = match cursor.next_event().await? {
            Some(HistoryEvent {
                event: WorkflowEvent::Started { input },
                ..
            }) => input,
            Some(other) => {
                return Err(corrupted(
                    id,
                    format!("history starts with {} instead of started", other.event.kind()),
                ))
            }
            None => return Err(corrupted(id, "history has no started event")),
        };

        let mut workflow = self.registry.create(&info.workflow_type, input)?;
        let mut step = workflow.on_start();

        loop {
            step = match step {
                Step::Yield(Command::SideEffect(effect)) => {
                    match cursor.next_decision(workflow.as_mut()).await? {
                        Some(recorded) => match recorded.event {
                            WorkflowEvent::SideEffectRecorded { name, outcome }
                                if name == effect.name() =>
                            {
                                debug!(sequence = recorded.sequence, %name, "replayed side effect");
                                workflow.on_resume(Resume::SideEffect(outcome.into_result()))
                            }
                            other => {
                                return Err(divergence(
                                    id,
                                    recorded.sequence,
                                    format!("side_effect({})", effect.name()),
                                    &other,
                                ))
                            }
                        },
                        None => {
                            let name = effect.name().to_string();
                            debug!(%name, "running side effect");
                            let result = effect.invoke().await;
                            if let Err(error) = &result {
                                warn!(%name, %error, "side effect failed");
                            }

                            let event = WorkflowEvent::SideEffectRecorded {
                                name,
                                outcome: result.clone().into(),
                            };
                            cursor.append(self.store, event, self.max_events).await?;
                            workflow.on_resume(Resume::SideEffect(result))
                        }
                    }
                }

                Step::Yield(Command::Timer(duration)) => {
                    match cursor.next_decision(workflow.as_mut()).await? {
                        Some(HistoryEvent {
                            sequence,
                            event: WorkflowEvent::TimerScheduled { fire_at, .. },
                            ..
                        }) => match cursor.next_decision(workflow.as_mut()).await? {
                            Some(HistoryEvent {
                                event:
                                    WorkflowEvent::TimerFired {
                                        scheduled_sequence,
                                        fired_at,
                                    },
                                sequence: fired_sequence,
                                ..
                            }) => {
                                if scheduled_sequence != sequence {
                                    return Err(corrupted(
                                        id,
                                        format!(
                                            "timer fired at {} references {}, pending timer is {}",
                                            fired_sequence, scheduled_sequence, sequence
                                        ),
                                    ));
                                }
                                if fired_at < fire_at {
                                    return Err(corrupted(
                                        id,
                                        format!(
                                            "timer {} fired at {} before its fire time {}",
                                            sequence, fired_at, fire_at
                                        ),
                                    ));
                                }
                                debug!(sequence, "replayed timer");
                                workflow.on_resume(Resume::TimerFired { fired_at })
                            }
                            Some(other) => {
                                return Err(corrupted(
                                    id,
                                    format!(
                                        "timer {} is followed by {} at {}",
                                        sequence,
                                        other.event.kind(),
                                        other.sequence
                                    ),
                                ))
                            }
                            None => return Ok(cursor.suspended(WaitingOn::Timer { fire_at })),
                        },
                        Some(other) => {
                            return Err(divergence(
                                id,
                                other.sequence,
                                format!("timer({}ms)", duration.as_millis()),
                                &other.event,
                            ))
                        }
                        None => {
                            let delta = chrono::Duration::from_std(duration)
                                .unwrap_or(chrono::Duration::MAX);
                            let fire_at = self
                                .clock
                                .now()
                                .checked_add_signed(delta)
                                .unwrap_or(DateTime::<Utc>::MAX_UTC);

                            let duration_ms =
                                u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                            let event = WorkflowEvent::TimerScheduled {
                                duration_ms,
                                fire_at,
                            };
                            cursor.append(self.store, event, self.max_events).await?;
                            info!(%fire_at, "timer scheduled");
                            return Ok(cursor.suspended(WaitingOn::Timer { fire_at }));
                        }
                    }
                }

                Step::Yield(Command::AwaitSignal) => {
                    if let Some(signal) = cursor.inbox.pop_front() {
                        debug!(signal = %signal.name, "delivering buffered signal");
                        workflow.on_resume(Resume::Signal(signal))
                    } else {
                        match cursor.next_event().await? {
                            Some(HistoryEvent {
                                event: WorkflowEvent::SignalReceived { signal },
                                sequence,
                                ..
                            }) => {
                                debug!(sequence, signal = %signal.name, "delivering signal");
                                workflow.on_resume(Resume::Signal(signal))
                            }
                            Some(other) => {
                                return Err(divergence(
                                    id,
                                    other.sequence,
                                    "await_signal".to_string(),
                                    &other.event,
                                ))
                            }
                            None => return Ok(cursor.suspended(WaitingOn::Signal)),
                        }
                    }
                }

                Step::Complete(result) => {
                    return match cursor.next_decision(workflow.as_mut()).await? {
                        Some(HistoryEvent {
                            event: WorkflowEvent::Completed { result: recorded },
                            sequence,
                            ..
                        }) => {
                            if recorded != result {
                                return Err(divergence(
                                    id,
                                    sequence,
                                    format!("complete({})", result),
                                    &WorkflowEvent::Completed { result: recorded },
                                ));
                            }
                            // Terminal event recorded but status never updated
                            self.store
                                .update_status(id, InstanceStatus::Completed, Some(result.clone()), None)
                                .await?;
                            Ok(cursor.finish(ExecutionState::Completed { result }))
                        }
                        Some(other) => Err(divergence(
                            id,
                            other.sequence,
                            "complete".to_string(),
                            &other.event,
                        )),
                        None => {
                            let event = WorkflowEvent::Completed {
                                result: result.clone(),
                            };
                            cursor.append(self.store, event, self.max_events).await?;
                            self.store
                                .update_status(id, InstanceStatus::Completed, Some(result.clone()), None)
                                .await?;
                            info!("workflow completed");
                            Ok(cursor.finish(ExecutionState::Completed { result }))
                        }
                    };
                }

                Step::Fail(error) => {
                    return match cursor.next_decision(workflow.as_mut()).await? {
                        Some(HistoryEvent {
                            event: WorkflowEvent::Failed { error: recorded },
                            sequence,
                            ..
                        }) => {
                            if recorded != error {
                                return Err(divergence(
                                    id,
                                    sequence,
                                    format!("fail({})", error),
                                    &WorkflowEvent::Failed { error: recorded },
                                ));
                            }
                            self.store
                                .update_status(id, InstanceStatus::Failed, None, Some(error.clone()))
                                .await?;
                            Ok(cursor.finish(ExecutionState::Failed { error }))
                        }
                        Some(other) => Err(divergence(
                            id,
                            other.sequence,
                            "fail".to_string(),
                            &other.event,
                        )),
                        None => {
                            let event = WorkflowEvent::Failed {
                                error: error.clone(),
                            };
                            cursor.append(self.store, event, self.max_events).await?;
                            self.store
                                .update_status(id, InstanceStatus::Failed, None, Some(error.clone()))
                                .await?;
                            info!(%error, "workflow failed");
                            Ok(cursor.finish(ExecutionState::Failed { error }))
                        }
                    };
                }
            };
        }
    }

    /// Record a fatal replay error on the instance
    async fn fail_instance(&self, instance_id: Uuid, cause: &EngineError) {
        let code = match cause {
            EngineError::ReplayDivergence { .. } => error_codes::REPLAY_DIVERGENCE,
            _ => error_codes::HISTORY_CORRUPTED,
        };
        let error = WorkflowError::new(cause.to_string()).with_code(code);
        error!(%instance_id, %cause, "instance cannot be replayed, marking failed");

        // The failure event is for audit only; the status update is what stops retries.
        match self.store.event_count(instance_id).await {
            Ok(next) => {
                let event = WorkflowEvent::Failed {
                    error: error.clone(),
                };
                if let Err(e) = self.store.append_events(instance_id, next, vec![event]).await {
                    warn!(%instance_id, "failed to record failure event: {}", e);
                }
            }
            Err(e) => warn!(%instance_id, "failed to count events: {}", e),
        }

        if let Err(e) = self
            .store
            .update_status(instance_id, InstanceStatus::Failed, None, Some(error))
            .await
        {
            error!(%instance_id, "failed to mark instance failed: {}", e);
        }
    }
}

/// Sequential reader over one history plus the signals it buffered
struct HistoryCursor<'s> {
    instance_id: Uuid,
    events: EventStream<'s>,
    exhausted: bool,
    next_sequence: i64,
    inbox: VecDeque<WorkflowSignal>,
    replayed: usize,
    written: usize,
}

impl<'s> HistoryCursor<'s> {
    fn new(instance_id: Uuid, events: EventStream<'s>) -> Self {
        Self {
            instance_id,
            events,
            exhausted: false,
            next_sequence: 0,
            inbox: VecDeque::new(),
            replayed: 0,
            written: 0,
        }
    }

    /// Next recorded event, or `None` once the history is exhausted
    async fn next_event(&mut self) -> Result<Option<HistoryEvent>, EngineError> {
        if self.exhausted {
            return Ok(None);
        }

        match self.events.next().await {
            Some(Ok(event)) => {
                if event.sequence != self.next_sequence {
                    return Err(corrupted(
                        self.instance_id,
                        format!(
                            "expected sequence {}, found {}",
                            self.next_sequence, event.sequence
                        ),
                    ));
                }
                self.next_sequence += 1;
                self.replayed += 1;
                Ok(Some(event))
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Next non-signal event; signals on the way are offered to the workflow
    async fn next_decision(
        &mut self,
        workflow: &mut dyn AnyWorkflow,
    ) -> Result<Option<HistoryEvent>, EngineError> {
        loop {
            match self.next_event().await? {
                Some(HistoryEvent {
                    event: WorkflowEvent::SignalReceived { signal },
                    sequence,
                    ..
                }) => match workflow.on_signal(&signal) {
                    SignalDisposition::Handled => {
                        debug!(sequence, signal = %signal.name, "signal handled by workflow");
                    }
                    SignalDisposition::Defer => {
                        debug!(sequence, signal = %signal.name, "signal buffered");
                        self.inbox.push_back(signal);
                    }
                },
                other => return Ok(other),
            }
        }
    }

    async fn append<S: HistoryStore>(
        &mut self,
        store: &S,
        event: WorkflowEvent,
        max_events: usize,
    ) -> Result<(), EngineError> {
        let count = self.next_sequence as usize;
        if count >= max_events {
            return Err(EngineError::TooManyEvents(
                self.instance_id,
                count + 1,
                max_events,
            ));
        }

        let kind = event.kind();
        self.next_sequence = store
            .append_events(self.instance_id, self.next_sequence, vec![event])
            .await?;
        self.written += 1;
        debug!(sequence = self.next_sequence - 1, %kind, "appended event");
        Ok(())
    }

    fn suspended(&self, waiting_on: WaitingOn) -> ExecutionOutcome {
        self.finish(ExecutionState::Suspended {
            sequence: self.next_sequence - 1,
            waiting_on,
        })
    }

    fn finish(&self, state: ExecutionState) -> ExecutionOutcome {
        ExecutionOutcome {
            instance_id: self.instance_id,
            state,
            events_replayed: self.replayed,
            events_written: self.written,
        }
    }
}

fn corrupted(instance_id: Uuid, reason: impl Into<String>) -> EngineError {
    EngineError::HistoryCorrupted {
        instance_id,
        reason: reason.into(),
    }
}

fn divergence(
    instance_id: Uuid,
    sequence: i64,
    expected: String,
    found: &WorkflowEvent,
) -> EngineError {
    let found = match found {
        WorkflowEvent::SideEffectRecorded { name, .. } => format!("side_effect_recorded({})", name),
        WorkflowEvent::TimerScheduled { duration_ms, .. } => {
            format!("timer_scheduled({}ms)", duration_ms)
        }
        WorkflowEvent::SignalReceived { signal } => format!("signal_received({})", signal.name),
        other => other.kind().to_string(),
    };

    EngineError::ReplayDivergence {
        instance_id,
        sequence,
        expected,
        found,
    }
}
