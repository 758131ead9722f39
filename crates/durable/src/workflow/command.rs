//! Commands yielded by workflows and the values that resume them

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{WorkflowError, WorkflowSignal};

/// Boxed future returned by a side-effect callback
pub type SideEffectFuture = BoxFuture<'static, Result<Value, WorkflowError>>;

type SideEffectFn = Box<dyn FnOnce() -> SideEffectFuture + Send>;

/// A named unit of non-deterministic work
///
/// The callback runs at most once per history position. Its outcome is
/// recorded and replayed to the workflow on every later execution.
pub struct SideEffect {
    name: String,
    callback: SideEffectFn,
}

impl SideEffect {
    /// Wrap an async callback whose output is serializable
    pub fn new<F, Fut, T>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
        T: Serialize,
    {
        let callback: SideEffectFn = Box::new(move || {
            async move {
                let value = callback().await?;
                serde_json::to_value(value).map_err(WorkflowError::from)
            }
            .boxed()
        });

        Self {
            name: name.into(),
            callback,
        }
    }

    /// Name recorded alongside the outcome
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(self) -> SideEffectFuture {
        (self.callback)()
    }
}

impl fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideEffect")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Suspension points a workflow can yield
#[derive(Debug)]
pub enum Command {
    /// Run non-deterministic work exactly once
    SideEffect(SideEffect),

    /// Wait for a durable timer
    Timer(Duration),

    /// Wait for the next external signal
    AwaitSignal,
}

impl Command {
    /// Create a side-effect command
    pub fn side_effect<F, Fut, T>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
        T: Serialize,
    {
        Self::SideEffect(SideEffect::new(name, callback))
    }

    /// Create a timer command
    pub fn timer(duration: Duration) -> Self {
        Self::Timer(duration)
    }

    /// The command's kind, used for replay matching
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SideEffect(_) => CommandKind::SideEffect,
            Self::Timer(_) => CommandKind::Timer,
            Self::AwaitSignal => CommandKind::AwaitSignal,
        }
    }
}

/// Discriminant of a [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SideEffect,
    Timer,
    AwaitSignal,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SideEffect => "side_effect",
            Self::Timer => "timer",
            Self::AwaitSignal => "await_signal",
        };
        write!(f, "{}", s)
    }
}

/// What the workflow does next
#[derive(Debug)]
pub enum Step<O> {
    /// Suspend on a command
    Yield(Command),

    /// Finish successfully
    Complete(O),

    /// Finish with an error
    Fail(WorkflowError),
}

impl<O> Step<O> {
    /// Yield a side effect
    pub fn side_effect<F, Fut, T>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
        T: Serialize,
    {
        Self::Yield(Command::side_effect(name, callback))
    }

    /// Yield a timer
    pub fn timer(duration: Duration) -> Self {
        Self::Yield(Command::Timer(duration))
    }

    /// Yield a signal wait
    pub fn await_signal() -> Self {
        Self::Yield(Command::AwaitSignal)
    }

    /// Convert the completion value, keeping commands and failures
    pub fn map_output<P>(self, f: impl FnOnce(O) -> P) -> Step<P> {
        match self {
            Self::Yield(command) => Step::Yield(command),
            Self::Complete(output) => Step::Complete(f(output)),
            Self::Fail(error) => Step::Fail(error),
        }
    }
}

/// Outcome of a command, fed back to [`Workflow::on_resume`](super::Workflow::on_resume)
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// Recorded outcome of a side effect
    SideEffect(Result<Value, WorkflowError>),

    /// The timer fired
    TimerFired { fired_at: DateTime<Utc> },

    /// A signal was delivered to the await point
    Signal(WorkflowSignal),
}

impl Resume {
    /// Kind of command this value resumes
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SideEffect(_) => CommandKind::SideEffect,
            Self::TimerFired { .. } => CommandKind::Timer,
            Self::Signal(_) => CommandKind::AwaitSignal,
        }
    }

    /// Decode a side-effect outcome into a typed value
    pub fn into_side_effect<T: DeserializeOwned>(self) -> Result<T, WorkflowError> {
        match self {
            Self::SideEffect(outcome) => {
                let value = outcome?;
                serde_json::from_value(value).map_err(WorkflowError::from)
            }
            other => Err(WorkflowError::new(format!(
                "expected side effect outcome, got {}",
                other.kind()
            ))),
        }
    }

    /// Take the delivered signal, if this resumes a signal wait
    pub fn into_signal(self) -> Option<WorkflowSignal> {
        match self {
            Self::Signal(signal) => Some(signal),
            _ => None,
        }
    }
}
