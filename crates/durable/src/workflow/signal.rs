//! Workflow signals for external communication

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// External signals that can be sent to running workflows
///
/// A signal is recorded in the instance history the moment it arrives,
/// whether or not the workflow is waiting for it.
///
/// # Example
///
/// ```
/// use serde::Deserialize;
/// use waypoint_durable::WorkflowSignal;
///
/// #[derive(Deserialize)]
/// #[serde(tag = "name", content = "payload", rename_all = "snake_case")]
/// enum Review {
///     Approved {},
///     Rejected { reason: String },
/// }
///
/// let signal = WorkflowSignal::new("rejected", serde_json::json!({ "reason": "spam" }));
/// match signal.decode::<Review>().unwrap() {
///     Review::Rejected { reason } => assert_eq!(reason, "spam"),
///     Review::Approved {} => unreachable!(),
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal name
    pub name: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,

    /// When the signal was sent
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::at(name, payload, Utc::now())
    }

    /// Create a signal with an explicit send time
    pub fn at(name: impl Into<String>, payload: serde_json::Value, sent_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at,
        }
    }

    /// Create a cancellation signal
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(
            signal_names::CANCEL,
            serde_json::json!({ "reason": reason.into() }),
        )
    }

    /// Check if this is a cancellation signal
    pub fn is_cancel(&self) -> bool {
        self.name == signal_names::CANCEL
    }

    /// Reason carried by a cancellation signal
    pub fn cancel_reason(&self) -> Option<&str> {
        if !self.is_cancel() {
            return None;
        }
        self.payload.get("reason").and_then(|r| r.as_str())
    }

    /// Decode into a workflow-owned signal enum
    ///
    /// The enum is expected to be adjacently tagged with `name` and
    /// `payload`, so every signal a workflow accepts is one variant.
    pub fn decode<S: DeserializeOwned>(&self) -> Result<S, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "name": self.name,
            "payload": self.payload,
        }))
    }
}

/// Reserved signal names
pub mod signal_names {
    /// Cancellation request
    pub const CANCEL: &str = "__cancel__";
}
