//! Waypoint worker process
//!
//! Wires the durable engine to PostgreSQL, registers the bundled workflows and
//! runs the resume worker and timer scanner until shutdown.

pub mod config;
pub mod telemetry;
pub mod workflows;

pub use config::{LogFormat, WorkerConfig};
pub use workflows::{register_all, ApprovalInput, ApprovalWorkflow, ReviewSignal};
