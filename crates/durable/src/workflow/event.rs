//! Workflow events for event sourcing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{WorkflowError, WorkflowSignal};

/// Events that make up an instance history
///
/// Every state change is one event. Events are append-only and replayed in
/// sequence order to rebuild the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// Always the first event of an instance
    Started { input: serde_json::Value },

    /// Terminal: the workflow returned its result
    Completed { result: serde_json::Value },

    /// Terminal: the workflow failed or its history could not be replayed
    Failed { error: WorkflowError },

    // =========================================================================
    // Commands
    // =========================================================================
    /// Cached outcome of a side effect
    SideEffectRecorded {
        name: String,
        outcome: SideEffectOutcome,
    },

    /// A durable timer was requested
    TimerScheduled {
        duration_ms: u64,
        fire_at: DateTime<Utc>,
    },

    /// The timer scheduled at `scheduled_sequence` fired
    TimerFired {
        scheduled_sequence: i64,
        fired_at: DateTime<Utc>,
    },

    // =========================================================================
    // External input
    // =========================================================================
    /// A signal arrived, whether or not the workflow was waiting
    SignalReceived { signal: WorkflowSignal },
}

impl WorkflowEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// The event's kind
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::Completed { .. } => EventKind::Completed,
            Self::Failed { .. } => EventKind::Failed,
            Self::SideEffectRecorded { .. } => EventKind::SideEffectRecorded,
            Self::TimerScheduled { .. } => EventKind::TimerScheduled,
            Self::TimerFired { .. } => EventKind::TimerFired,
            Self::SignalReceived { .. } => EventKind::SignalReceived,
        }
    }
}

/// Discriminant of a [`WorkflowEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Completed,
    Failed,
    SideEffectRecorded,
    TimerScheduled,
    TimerFired,
    SignalReceived,
}

impl EventKind {
    /// Stable name, matching the serialized `type` tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::SideEffectRecorded => "side_effect_recorded",
            Self::TimerScheduled => "timer_scheduled",
            Self::TimerFired => "timer_fired",
            Self::SignalReceived => "signal_received",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recorded result of a side-effect callback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SideEffectOutcome {
    Ok { value: serde_json::Value },
    Err { error: WorkflowError },
}

impl SideEffectOutcome {
    pub fn into_result(self) -> Result<serde_json::Value, WorkflowError> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Err { error } => Err(error),
        }
    }
}

impl From<Result<serde_json::Value, WorkflowError>> for SideEffectOutcome {
    fn from(result: Result<serde_json::Value, WorkflowError>) -> Self {
        match result {
            Ok(value) => Self::Ok { value },
            Err(error) => Self::Err { error },
        }
    }
}

/// An event as stored in an instance history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Owning instance
    pub instance_id: Uuid,

    /// 0-based position in the history
    pub sequence: i64,

    /// When the event was appended
    pub recorded_at: DateTime<Utc>,

    /// Event body
    pub event: WorkflowEvent,
}
