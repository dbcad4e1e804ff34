//! The single-quantum executor interface the scheduler drives.

use crate::quantum::{ExternalContext, QuantumPayload, TaskDef};
use crate::report::QuantumReport;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Raised by a failing execution; the scheduler catches and classifies it.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Executes one quantum in-process. Implementations must not depend on the
/// execution model (in-process vs. worker); the harness (`qgraph-exec`) is
/// what decides where this call actually runs.
///
/// Implemented as an interface with concrete types rather than a class
/// hierarchy: the real executor that calls into task machinery, and
/// [`RecordingExecutor`] below, a mock used by tests.
pub trait QuantumExecutor: Send + Sync {
    /// Execute a single quantum. Returns the quantum as adjusted by the task's
    /// own input handling; the scheduler treats the returned value opaquely.
    fn execute(
        &self,
        task_def: &TaskDef,
        quantum: QuantumPayload,
        context: &ExternalContext,
    ) -> Result<QuantumPayload, ExecutorError>;

    /// Optional richer detail about the last call to `execute`, consulted by
    /// the scheduler after every node completes. Default: unsupported.
    fn report(&self) -> Option<QuantumReport> {
        None
    }
}

/// An append-only container of small records, safe to share across the
/// threads (or, inside a single worker process, across the single in-process
/// collector) that observe quanta as they run.
///
/// Not a shared object graph: a value is pushed once per observation and
/// never mutated afterward. See `qgraph-exec`'s report aggregator, which is
/// the scheduler's own instance of the same idea.
pub trait Appender<T>: Send + Sync {
    fn append(&self, value: T);
    fn snapshot(&self) -> Vec<T>;
}

/// The in-memory appender used when everything happens in one process.
#[derive(Debug, Default)]
pub struct InMemoryAppender<T> {
    inner: Mutex<Vec<T>>,
}

impl<T> InMemoryAppender<T> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Vec::new()) }
    }
}

impl<T: Clone + Send> Appender<T> for InMemoryAppender<T> {
    fn append(&self, value: T) {
        self.inner.lock().push(value);
    }

    fn snapshot(&self) -> Vec<T> {
        self.inner.lock().clone()
    }
}

/// Test/diagnostic executor that records every `(label, data id)` it was
/// asked to run instead of doing any real work, mirroring the mock executors
/// used by the reference test suite this scheduler is specified against.
///
/// Always succeeds, unless `fail_labels` names the task's label, in which
/// case it raises; used to exercise failure propagation in tests without a
/// real task implementation.
pub struct RecordingExecutor {
    quanta: Arc<dyn Appender<(String, QuantumPayload)>>,
    fail_labels: Vec<String>,
    sleep_labels: Vec<(String, std::time::Duration)>,
    fixed_report: Option<QuantumReport>,
}

impl RecordingExecutor {
    pub fn new(quanta: Arc<dyn Appender<(String, QuantumPayload)>>) -> Self {
        Self { quanta, fail_labels: Vec::new(), sleep_labels: Vec::new(), fixed_report: None }
    }

    /// Make `getReport()` return `report` after every call to `execute`,
    /// exercising the scheduler's §4.1 consultation of the executor's own
    /// report alongside the one it builds itself.
    pub fn reporting(mut self, report: QuantumReport) -> Self {
        self.fixed_report = Some(report);
        self
    }

    /// Make every quantum whose task label is in `labels` raise instead of succeeding.
    pub fn failing(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fail_labels.extend(labels.into_iter().map(Into::into));
        self
    }

    /// Make every quantum whose task label is in `labels` sleep for `duration` before returning.
    pub fn sleeping(
        mut self,
        labels: impl IntoIterator<Item = (impl Into<String>, std::time::Duration)>,
    ) -> Self {
        self.sleep_labels
            .extend(labels.into_iter().map(|(l, d)| (l.into(), d)));
        self
    }

    /// The values passed for a given data-id field, in observation order.
    pub fn observed(&self) -> Vec<(String, QuantumPayload)> {
        self.quanta.snapshot()
    }
}

impl QuantumExecutor for RecordingExecutor {
    fn execute(
        &self,
        task_def: &TaskDef,
        quantum: QuantumPayload,
        _context: &ExternalContext,
    ) -> Result<QuantumPayload, ExecutorError> {
        if task_def.is_noop() {
            return Ok(quantum);
        }
        if let Some((_, duration)) = self
            .sleep_labels
            .iter()
            .find(|(label, _)| label == &task_def.label)
        {
            std::thread::sleep(*duration);
        }
        if self.fail_labels.iter().any(|label| label == &task_def.label) {
            return Err(ExecutorError::new(format!(
                "task {} raised an expected failure",
                task_def.label
            )));
        }
        self.quanta.append((task_def.label.clone(), quantum.clone()));
        Ok(quantum)
    }

    fn report(&self) -> Option<QuantumReport> {
        self.fixed_report.clone()
    }
}
