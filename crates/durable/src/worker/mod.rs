//! Background processing for the engine
//!
//! This module provides:
//! - [`ResumeWorker`] - Executes queued resumes with bounded concurrency
//! - [`QueuePoller`] - Resume-queue polling with exponential backoff
//! - [`TimerScanner`] - Fires due timers on an interval
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    ResumeWorker                      │
//! │  ┌─────────────┐            ┌─────────────────────┐  │
//! │  │ QueuePoller │            │  Stale Reclaimer    │  │
//! │  │  (polling)  │            │     (30s)           │  │
//! │  └──────┬──────┘            └─────────────────────┘  │
//! │         ▼                                            │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │  WorkflowEngine::execute (Semaphore-limited)   │  │
//! │  └────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//!
//! ┌──────────────┐   due_timers   ┌──────────────────────┐
//! │ TimerScanner │ ─────────────▶ │ WorkflowEngine::     │
//! │  (interval)  │                │   fire_due_timers    │
//! └──────────────┘                └──────────────────────┘
//! ```

mod poller;
mod resume_worker;
mod timer_scanner;

pub use poller::{PollerConfig, PollerError, QueuePoller};
pub use resume_worker::{ResumeWorker, ResumeWorkerConfig, ResumeWorkerError, WorkerStatus};
pub use timer_scanner::{TimerScanner, TimerScannerConfig};

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
