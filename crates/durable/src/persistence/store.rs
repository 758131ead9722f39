//! History store trait and types

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// Errors from store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Business key already taken for this workflow type
    #[error("business key {business_key:?} already used by a {workflow_type} instance")]
    DuplicateBusinessKey {
        workflow_type: String,
        business_key: String,
    },

    /// Another writer appended first
    #[error("concurrent append on {instance_id}: expected sequence {expected}, actual {actual}")]
    ConcurrentAppend {
        instance_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
}

impl InstanceStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown instance status: {}",
                other
            ))),
        }
    }
}

/// Parameters for creating an instance
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: Uuid,
    pub workflow_type: String,
    pub business_key: String,
    pub input: serde_json::Value,
}

/// Instance information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceInfo {
    pub id: Uuid,
    pub business_key: String,
    pub workflow_type: String,
    pub status: InstanceStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A scheduled timer whose fire time has passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTimer {
    pub instance_id: Uuid,
    /// Sequence of the `TimerScheduled` event
    pub scheduled_sequence: i64,
    pub fire_at: DateTime<Utc>,
}

/// Exclusive hold on one instance
///
/// Dropping a lease without releasing it still frees the instance, though
/// possibly later than an explicit release would.
#[async_trait]
pub trait InstanceLease: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

/// Lazy stream of history events in sequence order
pub type EventStream<'a> = BoxStream<'a, Result<HistoryEvent, StoreError>>;

/// Append-only history of workflow instances
///
/// Implementations must guarantee:
/// - Events of one instance are totally ordered by a 0-based sequence
/// - `append_events` is atomic and rejects writers with a stale sequence
/// - Events are never mutated or removed
/// - Every instance history starts with `Started`
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Create an instance record with status `Running` together with its
    /// `Started` event at sequence 0
    ///
    /// Both are written or neither is. Fails with
    /// [`StoreError::DuplicateBusinessKey`] when business keys are unique and
    /// `(workflow_type, business_key)` is taken.
    async fn create_instance(&self, instance: NewInstance) -> Result<InstanceInfo, StoreError>;

    /// Wait for exclusive access to an instance
    ///
    /// The lease excludes every holder using the same underlying storage,
    /// including other processes, until it is released.
    async fn lock_instance(&self, instance_id: Uuid)
        -> Result<Box<dyn InstanceLease>, StoreError>;

    /// Get instance information
    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceInfo, StoreError>;

    /// Look up an instance by business key
    async fn find_by_business_key(
        &self,
        workflow_type: &str,
        business_key: &str,
    ) -> Result<Option<InstanceInfo>, StoreError>;

    /// Append events with optimistic concurrency
    ///
    /// `expected_sequence` is the sequence the first new event gets, which
    /// equals the number of events already stored. Returns the next free
    /// sequence after the append.
    async fn append_events(
        &self,
        instance_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError>;

    /// Stream the history of an instance in sequence order
    ///
    /// Each call starts a fresh read from sequence 0.
    fn load_events(&self, instance_id: Uuid) -> EventStream<'_>;

    /// Load the full history into memory
    async fn load_history(&self, instance_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        self.load_events(instance_id).try_collect().await
    }

    /// Number of events stored for an instance
    async fn event_count(&self, instance_id: Uuid) -> Result<i64, StoreError> {
        Ok(self.load_history(instance_id).await?.len() as i64)
    }

    /// Update instance status, result and error
    async fn update_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    /// Timers of running instances that are due at `now` and not yet fired
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueTimer>, StoreError>;
}
