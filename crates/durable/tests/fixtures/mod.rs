//! Workflows and helpers shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use waypoint_durable::engine::ManualClock;
use waypoint_durable::persistence::{
    DueTimer, EventStream, HistoryStore, InstanceInfo, InstanceLease, InstanceStatus, NewInstance,
    StoreError,
};
use waypoint_durable::workflow::{error_codes, SignalDisposition, WorkflowEvent};
use waypoint_durable::{
    InMemoryHistoryStore, InMemoryResumeQueue, Resume, Step, Workflow, WorkflowEngine,
    WorkflowError, WorkflowSignal,
};

pub type MemoryEngine = WorkflowEngine<InMemoryHistoryStore, InMemoryResumeQueue>;

fn calls() -> &'static Mutex<HashMap<String, usize>> {
    static CALLS: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
    CALLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Count an invocation of a side effect, returning the new total
pub fn record_call(key: &str) -> usize {
    let mut calls = calls().lock();
    let count = calls.entry(key.to_string()).or_default();
    *count += 1;
    *count
}

pub fn call_count(key: &str) -> usize {
    calls().lock().get(key).copied().unwrap_or(0)
}

/// Engine over fresh in-memory adapters with every fixture workflow registered
pub fn memory_engine(clock: &ManualClock) -> MemoryEngine {
    engine_on(
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(InMemoryResumeQueue::new()),
        clock,
    )
}

pub fn engine_on(
    store: Arc<InMemoryHistoryStore>,
    queue: Arc<InMemoryResumeQueue>,
    clock: &ManualClock,
) -> MemoryEngine {
    let mut engine = WorkflowEngine::new(store, queue).with_clock(Arc::new(clock.clone()));
    engine.register::<ChargeWorkflow>();
    engine.register::<SleepWorkflow>();
    engine.register::<SleepThenSignal>();
    engine.register::<CancellableSleep>();
    engine.register::<DeclinedCharge>();
    engine.register::<SlowCharge>();
    engine
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInput {
    pub order_id: String,
}

/// Charge once, then wait for a "ship" signal
pub struct ChargeWorkflow {
    order_id: String,
    receipt: Option<Value>,
}

impl Workflow for ChargeWorkflow {
    const TYPE: &'static str = "charge";
    type Input = OrderInput;
    type Output = Value;

    fn new(input: OrderInput) -> Self {
        Self {
            order_id: input.order_id,
            receipt: None,
        }
    }

    fn on_start(&mut self) -> Step<Value> {
        let key = format!("charge:{}", self.order_id);
        Step::side_effect("charge", move || async move {
            let call = record_call(&key);
            Ok::<_, WorkflowError>(json!({ "receipt": format!("r-{}", call) }))
        })
    }

    fn on_resume(&mut self, resume: Resume) -> Step<Value> {
        match resume {
            Resume::SideEffect(outcome) => match outcome {
                Ok(receipt) => {
                    self.receipt = Some(receipt);
                    Step::await_signal()
                }
                Err(error) => Step::Fail(error),
            },
            Resume::Signal(signal) if signal.name == "ship" => Step::Complete(json!({
                "order_id": self.order_id,
                "receipt": self.receipt,
            })),
            Resume::Signal(_) => Step::await_signal(),
            Resume::TimerFired { .. } => Step::Fail(WorkflowError::new("no timers here")),
        }
    }
}

/// Sleep for a minute and report when the timer fired
pub struct SleepWorkflow;

impl Workflow for SleepWorkflow {
    const TYPE: &'static str = "sleep";
    type Input = ();
    type Output = String;

    fn new(_: ()) -> Self {
        Self
    }

    fn on_start(&mut self) -> Step<String> {
        Step::timer(Duration::from_secs(60))
    }

    fn on_resume(&mut self, resume: Resume) -> Step<String> {
        match resume {
            Resume::TimerFired { fired_at } => Step::Complete(fired_at.to_rfc3339()),
            other => Step::Fail(WorkflowError::new(format!("unexpected {:?}", other))),
        }
    }
}

/// Sleep, then take the next signal; signals sent during the sleep are buffered
pub struct SleepThenSignal;

impl Workflow for SleepThenSignal {
    const TYPE: &'static str = "sleep_then_signal";
    type Input = ();
    type Output = String;

    fn new(_: ()) -> Self {
        Self
    }

    fn on_start(&mut self) -> Step<String> {
        Step::timer(Duration::from_secs(10))
    }

    fn on_resume(&mut self, resume: Resume) -> Step<String> {
        match resume {
            Resume::TimerFired { .. } => Step::await_signal(),
            Resume::Signal(signal) => Step::Complete(signal.name),
            other => Step::Fail(WorkflowError::new(format!("unexpected {:?}", other))),
        }
    }
}

/// Sleep that notes cancellation as soon as it is recorded
pub struct CancellableSleep {
    cancelled: Option<String>,
}

impl Workflow for CancellableSleep {
    const TYPE: &'static str = "cancellable_sleep";
    type Input = ();
    type Output = String;

    fn new(_: ()) -> Self {
        Self { cancelled: None }
    }

    fn on_start(&mut self) -> Step<String> {
        Step::timer(Duration::from_secs(30))
    }

    fn on_resume(&mut self, resume: Resume) -> Step<String> {
        match (resume, self.cancelled.take()) {
            (Resume::TimerFired { .. }, Some(reason)) => {
                Step::Fail(WorkflowError::cancelled(reason))
            }
            (Resume::TimerFired { .. }, None) => Step::Complete("slept".into()),
            (other, _) => Step::Fail(WorkflowError::new(format!("unexpected {:?}", other))),
        }
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> SignalDisposition {
        match signal.cancel_reason() {
            Some(reason) => {
                self.cancelled = Some(reason.to_string());
                SignalDisposition::Handled
            }
            None if signal.is_cancel() => {
                self.cancelled = Some("cancelled".to_string());
                SignalDisposition::Handled
            }
            None => SignalDisposition::Defer,
        }
    }
}

/// Charge that takes a while, then completes with the receipt
pub struct SlowCharge {
    order_id: String,
}

impl Workflow for SlowCharge {
    const TYPE: &'static str = "slow_charge";
    type Input = OrderInput;
    type Output = Value;

    fn new(input: OrderInput) -> Self {
        Self {
            order_id: input.order_id,
        }
    }

    fn on_start(&mut self) -> Step<Value> {
        let key = format!("slow:{}", self.order_id);
        Step::side_effect("charge", move || async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let call = record_call(&key);
            Ok::<_, WorkflowError>(json!({ "receipt": format!("r-{}", call) }))
        })
    }

    fn on_resume(&mut self, resume: Resume) -> Step<Value> {
        match resume.into_side_effect::<Value>() {
            Ok(receipt) => Step::Complete(receipt),
            Err(error) => Step::Fail(error),
        }
    }
}

/// Side effect that always fails
pub struct DeclinedCharge {
    order_id: String,
}

impl Workflow for DeclinedCharge {
    const TYPE: &'static str = "declined_charge";
    type Input = OrderInput;
    type Output = Value;

    fn new(input: OrderInput) -> Self {
        Self {
            order_id: input.order_id,
        }
    }

    fn on_start(&mut self) -> Step<Value> {
        let key = format!("declined:{}", self.order_id);
        Step::side_effect("charge", move || async move {
            record_call(&key);
            Err::<Value, _>(WorkflowError::side_effect("card declined"))
        })
    }

    fn on_resume(&mut self, resume: Resume) -> Step<Value> {
        match resume.into_side_effect::<Value>() {
            Ok(value) => Step::Complete(value),
            Err(error) => Step::Fail(error),
        }
    }
}

/// Side effect, then a timer, then a signal wait
pub struct StepsV1;

/// Same type name as [`StepsV1`] with the timer replaced by a side effect
pub struct StepsV2;

impl Workflow for StepsV1 {
    const TYPE: &'static str = "steps";
    type Input = ();
    type Output = ();

    fn new(_: ()) -> Self {
        Self
    }

    fn on_start(&mut self) -> Step<()> {
        Step::side_effect("a", || async { Ok::<_, WorkflowError>(1) })
    }

    fn on_resume(&mut self, resume: Resume) -> Step<()> {
        match resume {
            Resume::SideEffect(_) => Step::timer(Duration::from_secs(10)),
            Resume::TimerFired { .. } => Step::await_signal(),
            Resume::Signal(_) => Step::Complete(()),
        }
    }
}

impl Workflow for StepsV2 {
    const TYPE: &'static str = "steps";
    type Input = ();
    type Output = ();

    fn new(_: ()) -> Self {
        Self
    }

    fn on_start(&mut self) -> Step<()> {
        Step::side_effect("a", || async { Ok::<_, WorkflowError>(1) })
    }

    fn on_resume(&mut self, resume: Resume) -> Step<()> {
        match resume {
            Resume::SideEffect(Ok(value)) if value == json!(1) => {
                Step::side_effect("b", || async { Ok::<_, WorkflowError>(2) })
            }
            Resume::SideEffect(_) => Step::await_signal(),
            Resume::Signal(_) => Step::Complete(()),
            Resume::TimerFired { .. } => Step::Fail(WorkflowError::new("no timers here")),
        }
    }
}

/// Check a failure carries the expected engine code
pub fn assert_code(error: &WorkflowError, code: &str) {
    assert!(
        error.has_code(code),
        "expected code {code}, got {:?} ({})",
        error.code,
        error.message
    );
}

pub const CANCELLED: &str = error_codes::CANCELLED;

/// In-memory store whose appends can be switched to fail like a lost connection
pub struct FlakyStore {
    inner: InMemoryHistoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryHistoryStore::new(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn create_instance(&self, instance: NewInstance) -> Result<InstanceInfo, StoreError> {
        self.inner.create_instance(instance).await
    }

    async fn lock_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Box<dyn InstanceLease>, StoreError> {
        self.inner.lock_instance(instance_id).await
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceInfo, StoreError> {
        self.inner.get_instance(instance_id).await
    }

    async fn find_by_business_key(
        &self,
        workflow_type: &str,
        business_key: &str,
    ) -> Result<Option<InstanceInfo>, StoreError> {
        self.inner
            .find_by_business_key(workflow_type, business_key)
            .await
    }

    async fn append_events(
        &self,
        instance_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection reset".into()));
        }
        self.inner
            .append_events(instance_id, expected_sequence, events)
            .await
    }

    fn load_events(&self, instance_id: Uuid) -> EventStream<'_> {
        self.inner.load_events(instance_id)
    }

    async fn event_count(&self, instance_id: Uuid) -> Result<i64, StoreError> {
        self.inner.event_count(instance_id).await
    }

    async fn update_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        result: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        self.inner
            .update_status(instance_id, status, result, error)
            .await
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueTimer>, StoreError> {
        self.inner.due_timers(now, limit).await
    }
}
