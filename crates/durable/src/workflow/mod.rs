//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`Command`] and [`Step`] for what a workflow yields
//! - [`Resume`] for the outcomes fed back to it
//! - [`WorkflowEvent`] enum for persisted events
//! - [`WorkflowSignal`] for external communication

mod command;
mod definition;
mod event;
mod signal;

pub use command::{Command, CommandKind, Resume, SideEffect, SideEffectFuture, Step};
pub use definition::{error_codes, SignalDisposition, Workflow, WorkflowError};
pub use event::{EventKind, HistoryEvent, SideEffectOutcome, WorkflowEvent};
pub use signal::{signal_names, WorkflowSignal};
