//! In-memory implementation of HistoryStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::engine::{InstanceGuard, InstanceLocks};
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// Internal instance state
struct InstanceState {
    info: InstanceInfo,
    events: Vec<HistoryEvent>,
}

/// In-memory implementation of HistoryStore
///
/// This is primarily for testing and embedding. It stores all data in
/// memory and provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use waypoint_durable::InMemoryHistoryStore;
///
/// let store = InMemoryHistoryStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryHistoryStore {
    instances: RwLock<HashMap<Uuid, InstanceState>>,
    business_keys: RwLock<HashMap<(String, String), Uuid>>,
    leases: InstanceLocks,
    unique_business_keys: bool,
}

/// Lease backed by the store's lock table
struct MemoryLease(InstanceGuard);

#[async_trait]
impl InstanceLease for MemoryLease {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        drop(self.0);
        Ok(())
    }
}

impl InMemoryHistoryStore {
    /// Create a new in-memory store with unique business keys
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            business_keys: RwLock::new(HashMap::new()),
            leases: InstanceLocks::new(),
            unique_business_keys: true,
        }
    }

    /// Enable or disable the business key uniqueness constraint
    pub fn with_unique_business_keys(mut self, unique: bool) -> Self {
        self.unique_business_keys = unique;
        self
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
        self.business_keys.write().clear();
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: NewInstance) -> Result<InstanceInfo, StoreError> {
        let mut keys = self.business_keys.write();
        let key = (instance.workflow_type.clone(), instance.business_key.clone());

        if self.unique_business_keys && keys.contains_key(&key) {
            return Err(StoreError::DuplicateBusinessKey {
                workflow_type: instance.workflow_type,
                business_key: instance.business_key,
            });
        }

        let now = Utc::now();
        let started = HistoryEvent {
            instance_id: instance.id,
            sequence: 0,
            recorded_at: now,
            event: WorkflowEvent::Started {
                input: instance.input.clone(),
            },
        };
        let info = InstanceInfo {
            id: instance.id,
            business_key: instance.business_key,
            workflow_type: instance.workflow_type,
            status: InstanceStatus::Running,
            input: instance.input,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        keys.entry(key).or_insert(instance.id);
        self.instances.write().insert(
            instance.id,
            InstanceState {
                info: info.clone(),
                events: vec![started],
            },
        );

        Ok(info)
    }

    async fn lock_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Box<dyn InstanceLease>, StoreError> {
        self.leases.prune();
        Ok(Box::new(MemoryLease(self.leases.acquire(instance_id).await)))
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceInfo, StoreError> {
        self.instances
            .read()
            .get(&instance_id)
            .map(|state| state.info.clone())
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn find_by_business_key(
        &self,
        workflow_type: &str,
        business_key: &str,
    ) -> Result<Option<InstanceInfo>, StoreError> {
        let id = self
            .business_keys
            .read()
            .get(&(workflow_type.to_string(), business_key.to_string()))
            .copied();

        Ok(id.and_then(|id| self.instances.read().get(&id).map(|s| s.info.clone())))
    }

    async fn append_events(
        &self,
        instance_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        let mut instances = self.instances.write();
        let state = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        let actual = state.events.len() as i64;
        if actual != expected_sequence {
            return Err(StoreError::ConcurrentAppend {
                instance_id,
                expected: expected_sequence,
                actual,
            });
        }

        let now = Utc::now();
        for event in events {
            let sequence = state.events.len() as i64;
            state.events.push(HistoryEvent {
                instance_id,
                sequence,
                recorded_at: now,
                event,
            });
        }
        state.info.updated_at = now;

        Ok(state.events.len() as i64)
    }

    fn load_events(&self, instance_id: Uuid) -> EventStream<'_> {
        // Snapshot under the read lock; the stream never holds the lock.
        let snapshot = self
            .instances
            .read()
            .get(&instance_id)
            .map(|state| state.events.clone());

        match snapshot {
            Some(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            None => stream::once(async move { Err(StoreError::InstanceNotFound(instance_id)) })
                .boxed(),
        }
    }

    async fn event_count(&self, instance_id: Uuid) -> Result<i64, StoreError> {
        self.instances
            .read()
            .get(&instance_id)
            .map(|state| state.events.len() as i64)
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn update_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let state = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        state.info.status = status;
        state.info.result = result;
        state.info.error = error;
        state.info.updated_at = Utc::now();
        Ok(())
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueTimer>, StoreError> {
        let instances = self.instances.read();
        let mut due: Vec<DueTimer> = instances
            .values()
            .filter(|state| state.info.status == InstanceStatus::Running)
            .filter_map(|state| pending_timer(state.info.id, &state.events))
            .filter(|timer| timer.fire_at <= now)
            .collect();

        due.sort_by_key(|timer| timer.fire_at);
        due.truncate(limit);
        Ok(due)
    }
}

/// The latest `TimerScheduled` that has no matching `TimerFired`
fn pending_timer(instance_id: Uuid, events: &[HistoryEvent]) -> Option<DueTimer> {
    let (scheduled_sequence, fire_at) = events.iter().rev().find_map(|e| match e.event {
        WorkflowEvent::TimerScheduled { fire_at, .. } => Some((e.sequence, fire_at)),
        _ => None,
    })?;

    let fired = events.iter().any(|e| {
        matches!(
            e.event,
            WorkflowEvent::TimerFired { scheduled_sequence: s, .. } if s == scheduled_sequence
        )
    });

    (!fired).then_some(DueTimer {
        instance_id,
        scheduled_sequence,
        fire_at,
    })
}
