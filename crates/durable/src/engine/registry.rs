//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type names to factories that build a workflow
//! from the JSON input recorded in its `Started` event.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::workflow::{Resume, SignalDisposition, Step, Workflow, WorkflowError, WorkflowSignal};

/// Type-erased workflow interface
///
/// Lets the runner drive workflows without knowing their concrete types.
/// Completion values cross this boundary as JSON.
pub trait AnyWorkflow: Send {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self) -> Step<Value>;

    fn on_resume(&mut self, resume: Resume) -> Step<Value>;

    fn on_signal(&mut self, signal: &WorkflowSignal) -> SignalDisposition;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> WorkflowWrapper<W> {
    fn erase(step: Step<W::Output>) -> Step<Value> {
        match step.map_output(serde_json::to_value) {
            Step::Complete(Ok(value)) => Step::Complete(value),
            Step::Complete(Err(e)) => Step::Fail(WorkflowError::from(e)),
            Step::Yield(command) => Step::Yield(command),
            Step::Fail(error) => Step::Fail(error),
        }
    }
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self) -> Step<Value> {
        Self::erase(self.inner.on_start())
    }

    fn on_resume(&mut self, resume: Resume) -> Step<Value> {
        Self::erase(self.inner.on_resume(resume))
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> SignalDisposition {
        self.inner.on_signal(signal)
    }
}

/// Factory function type for creating workflows from JSON input
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a workflow type
    ///
    /// Registering a second definition under the same `TYPE` replaces the
    /// first; instances recorded by the old definition will then replay
    /// against the new one.
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let workflow = W::new(typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a workflow instance from type name and JSON input
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(RegistryError::Deserialization)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Input did not match the workflow's input type
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}
