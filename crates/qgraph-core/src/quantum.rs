//! The quantum: the atomic unit of work scheduled by the graph executor.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An opaque payload carried through the scheduler untouched.
///
/// The scheduler never inspects the contents; it is handed to the
/// [`QuantumExecutor`](crate::executor::QuantumExecutor) and the value returned
/// from `execute` replaces it in the report. Represented as JSON so it can cross
/// a worker process boundary without the scheduler needing to know the concrete
/// task-specific type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantumPayload(pub serde_json::Value);

impl Deref for QuantumPayload {
    type Target = serde_json::Value;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<serde_json::Value> for QuantumPayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for QuantumPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to the data-access environment ("the butler"), opaque to the core.
///
/// Carried from caller through scheduler to executor without interpretation.
/// Represented the same way as [`QuantumPayload`] so it can be handed to a
/// worker process when `numProc > 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalContext(pub serde_json::Value);

impl Deref for ExternalContext {
    type Target = serde_json::Value;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<serde_json::Value> for ExternalContext {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// The static description of a task, as seen by the scheduler.
///
/// Everything else about a task (its concrete implementation, its connections,
/// its configuration) lives outside the core; the scheduler only needs enough
/// to print a useful label and to enforce the multiprocess capability rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    /// Human-readable label, used by the canonical fixup and in reports.
    pub label: String,
    /// Identity of the task's implementation class. `None` is the placeholder
    /// used in tests; the scheduler runs it as a no-op success in-process.
    pub task_class: Option<String>,
    /// Whether this task may be dispatched to a worker process.
    pub supports_multiprocess: bool,
}

impl TaskDef {
    /// Build a task definition for a task that does support running in a worker.
    pub fn new(label: impl Into<String>, task_class: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            task_class: Some(task_class.into()),
            supports_multiprocess: true,
        }
    }

    /// Build the `taskClass == None` placeholder used by tests: always a no-op success.
    pub fn placeholder(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            task_class: None,
            supports_multiprocess: true,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.task_class.is_none()
    }

    /// Turn off the multiprocess capability flag, e.g. for a task whose
    /// implementation is known not to be fork/pickle-safe.
    pub fn without_multiprocess(mut self) -> Self {
        self.supports_multiprocess = false;
        self
    }
}

impl fmt::Display for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// A node in the quantum graph: one task bound to one concrete data identifier.
///
/// `index` is stable and unique within a graph; it is the only thing the
/// scheduler uses to refer to a node across its bookkeeping sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumNode {
    pub index: usize,
    pub task_def: Arc<TaskDef>,
    pub quantum: QuantumPayload,
    pub dependencies: BTreeSet<usize>,
}

impl QuantumNode {
    pub fn new(
        index: usize,
        task_def: impl Into<Arc<TaskDef>>,
        quantum: impl Into<QuantumPayload>,
        dependencies: impl IntoIterator<Item = usize>,
    ) -> Self {
        Self {
            index,
            task_def: task_def.into(),
            quantum: quantum.into(),
            dependencies: dependencies.into_iter().collect(),
        }
    }
}

impl PartialEq for QuantumNode {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for QuantumNode {}
