//! Workflow execution engine
//!
//! The engine module provides the `WorkflowEngine` which replays instances
//! from their event history and advances them through side effects, timers
//! and signals.

mod clock;
mod executor;
mod lock;
mod registry;
mod runner;

pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{EngineConfig, EngineError, WorkflowEngine};
pub use lock::{InstanceGuard, InstanceLocks};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use runner::{ExecutionOutcome, ExecutionState, Runner, WaitingOn, DEFAULT_MAX_EVENTS};
