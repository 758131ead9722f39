//! # Durable Workflow Engine
//!
//! Event-sourced workflows that survive process restarts through deterministic replay.
//!
//! ## Features
//!
//! - **Explicit state machines**: workflows yield side effects, timers and signal waits as commands
//! - **Deterministic replay**: side effects run once; their recorded outcomes are replayed afterwards
//! - **Durable timers**: timers fire only after their recorded fire time, driven by a pluggable clock
//! - **Typed signals**: signals decode into workflow-defined enums; `__cancel__` is reserved
//! - **Optimistic concurrency**: appends carry an expected sequence, so concurrent executions cannot fork a history
//! - **Resume queue**: at-least-once resume delivery with `SKIP LOCKED` claiming in PostgreSQL
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (per-instance locks, signals, timers, append-race retry)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Runner                               │
//! │  (replays history, runs new commands, suspends on waits)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              HistoryStore  /  ResumeQueue                    │
//! │  (PostgreSQL: instances, history events, resume queue)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ResumeWorker  /  TimerScanner                   │
//! │  (claims resumes, fires due timers)                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use waypoint_durable::prelude::*;
//!
//! struct Reminder {
//!     user: String,
//! }
//!
//! impl Workflow for Reminder {
//!     const TYPE: &'static str = "reminder";
//!     type Input = String;
//!     type Output = String;
//!
//!     fn new(user: String) -> Self {
//!         Self { user }
//!     }
//!
//!     fn on_start(&mut self) -> Step<String> {
//!         Step::timer(Duration::from_secs(3600))
//!     }
//!
//!     fn on_resume(&mut self, _: Resume) -> Step<String> {
//!         let user = self.user.clone();
//!         Step::side_effect("send_email", move || async move { send_email(&user).await })
//!     }
//! }
//! ```

pub mod engine;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        Clock, EngineConfig, EngineError, ExecutionOutcome, ExecutionState, ManualClock,
        SystemClock, WaitingOn, WorkflowEngine,
    };
    pub use crate::persistence::{
        HistoryStore, InMemoryHistoryStore, InstanceInfo, InstanceStatus, PostgresHistoryStore,
        StoreError,
    };
    pub use crate::queue::{InMemoryResumeQueue, PostgresResumeQueue, ResumeQueue};
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{ResumeWorker, ResumeWorkerConfig, TimerScanner, TimerScannerConfig};
    pub use crate::workflow::{
        Command, Resume, SignalDisposition, Step, Workflow, WorkflowError, WorkflowEvent,
        WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use engine::{EngineConfig, EngineError, ExecutionOutcome, WorkflowEngine, WorkflowRegistry};
pub use persistence::{
    HistoryStore, InMemoryHistoryStore, InstanceStatus, PostgresHistoryStore, StoreError,
};
pub use queue::{InMemoryResumeQueue, PostgresResumeQueue, QueueError, ResumeQueue};
pub use reliability::RetryPolicy;
pub use worker::{ResumeWorker, ResumeWorkerConfig, TimerScanner, TimerScannerConfig};
pub use workflow::{Command, Resume, Step, Workflow, WorkflowError, WorkflowEvent, WorkflowSignal};
