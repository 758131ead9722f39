// Testimonial approval workflow
//
// Waits for a reviewer decision delivered as a signal.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use waypoint_durable::{Resume, Step, Workflow, WorkflowError, WorkflowSignal};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub testimonial_id: i64,
}

/// Reviewer decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "snake_case")]
pub enum ReviewSignal {
    Approved {},
    Rejected {
        #[serde(default)]
        reason: Option<String>,
    },
}

pub struct ApprovalWorkflow {
    testimonial_id: i64,
}

impl ApprovalWorkflow {
    fn on_review(&self, signal: WorkflowSignal) -> Step<String> {
        if signal.is_cancel() {
            let reason = signal.cancel_reason().unwrap_or("cancelled").to_string();
            return Step::Fail(WorkflowError::cancelled(reason));
        }

        match signal.decode::<ReviewSignal>() {
            Ok(ReviewSignal::Approved {}) => {
                info!(testimonial_id = self.testimonial_id, "Testimonial approved");
                Step::Complete("Testimonial approved".to_string())
            }
            Ok(ReviewSignal::Rejected { reason }) => {
                info!(
                    testimonial_id = self.testimonial_id,
                    reason = reason.as_deref().unwrap_or(""),
                    "Testimonial rejected"
                );
                Step::Complete("Testimonial rejected".to_string())
            }
            Err(e) => {
                debug!(
                    testimonial_id = self.testimonial_id,
                    signal = %signal.name,
                    error = %e,
                    "Ignoring unrecognised signal"
                );
                Step::await_signal()
            }
        }
    }
}

impl Workflow for ApprovalWorkflow {
    const TYPE: &'static str = "ApprovalWorkflow";
    type Input = ApprovalInput;
    type Output = String;

    fn new(input: ApprovalInput) -> Self {
        Self {
            testimonial_id: input.testimonial_id,
        }
    }

    fn on_start(&mut self) -> Step<String> {
        Step::await_signal()
    }

    fn on_resume(&mut self, resume: Resume) -> Step<String> {
        match resume {
            Resume::Signal(signal) => self.on_review(signal),
            other => Step::Fail(WorkflowError::new(format!(
                "approval only waits for signals, got {:?}",
                other.kind()
            ))),
        }
    }
}
