//! Workflow definitions shipped with the worker

mod approval;

pub use approval::{ApprovalInput, ApprovalWorkflow, ReviewSignal};

use waypoint_durable::{HistoryStore, ResumeQueue, WorkflowEngine};

/// Register every bundled workflow with an engine
pub fn register_all<S: HistoryStore, Q: ResumeQueue>(engine: &mut WorkflowEngine<S, Q>) {
    engine.register::<ApprovalWorkflow>();
}
