//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{Resume, Step, WorkflowSignal};

/// Well-known [`WorkflowError`] codes written by the engine
pub mod error_codes {
    /// Recorded history no longer matches what the definition yields
    pub const REPLAY_DIVERGENCE: &str = "replay_divergence";
    /// Recorded history violates ordering or timer invariants
    pub const HISTORY_CORRUPTED: &str = "history_corrupted";
    /// A side-effect callback returned an error
    pub const SIDE_EFFECT_FAILED: &str = "side_effect_failed";
    /// The workflow observed a cancellation signal
    pub const CANCELLED: &str = "cancelled";
    /// A workflow value could not be (de)serialized
    pub const SERIALIZATION: &str = "serialization";
}

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Error produced by a failing side effect
    pub fn side_effect(message: impl Into<String>) -> Self {
        Self::new(message).with_code(error_codes::SIDE_EFFECT_FAILED)
    }

    /// Error produced when a workflow gives up after a cancellation signal
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(reason).with_code(error_codes::CANCELLED)
    }

    /// Check the error code
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string()).with_code(error_codes::SERIALIZATION)
    }
}

/// What a workflow did with a signal offered outside of an await point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalDisposition {
    /// Keep the signal buffered until the next `AwaitSignal`
    #[default]
    Defer,
    /// The workflow consumed the signal; it will not be delivered again
    Handled,
}

/// A workflow is a deterministic state machine driven by its history
///
/// The engine drives a workflow by calling `on_start` once and then
/// `on_resume` with the outcome of every [`Command`](super::Command) it
/// yields, until the workflow returns [`Step::Complete`] or [`Step::Fail`].
/// On every resume the engine rebuilds the workflow from scratch and feeds it
/// the recorded outcomes, so it reaches exactly the point where it left off.
///
/// # Determinism
///
/// Given the same input and the same sequence of resume values, a workflow
/// must yield the same sequence of commands. Clock reads, randomness and I/O
/// belong inside a side effect.
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::prelude::*;
///
/// struct Greeting { name: String, greeted: bool }
///
/// impl Workflow for Greeting {
///     const TYPE: &'static str = "greeting";
///     type Input = String;
///     type Output = String;
///
///     fn new(name: String) -> Self {
///         Self { name, greeted: false }
///     }
///
///     fn on_start(&mut self) -> Step<String> {
///         let name = self.name.clone();
///         Step::side_effect("send_email", move || async move { send_email(&name).await })
///     }
///
///     fn on_resume(&mut self, resume: Resume) -> Step<String> {
///         match resume.into_side_effect::<()>() {
///             Ok(()) => Step::Complete(format!("greeted {}", self.name)),
///             Err(e) => Step::Fail(e),
///         }
///     }
/// }
/// ```
pub trait Workflow: Send + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when the workflow completes
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    fn new(input: Self::Input) -> Self;

    /// Called once when execution (or replay) begins
    fn on_start(&mut self) -> Step<Self::Output>;

    /// Called with the outcome of the previously yielded command
    fn on_resume(&mut self, resume: Resume) -> Step<Self::Output>;

    /// Called for signals that arrive while the workflow is not awaiting one
    ///
    /// The default buffers the signal for the next `AwaitSignal`.
    fn on_signal(&mut self, signal: &WorkflowSignal) -> SignalDisposition {
        let _ = signal;
        SignalDisposition::Defer
    }
}
