//! Per-node and whole-run outcome records appended by the scheduler.

use crate::state::NodeState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a non-`Succeeded` terminal state came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClassification {
    /// The task itself raised; classification comes from the worker (or, in
    /// in-process mode, from the executor call returning an error).
    TaskRaised,
    /// The worker harness crashed before or after invoking the executor
    /// (panic, unexpected exit not attributable to the task).
    HarnessCrashed,
    /// The per-worker deadline elapsed.
    TimedOut,
    /// The worker process was killed by a signal (segfault, OOM kill, ...).
    KilledBySignal,
    /// A predecessor was non-`Succeeded`, so this node was never dispatched.
    Skipped,
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClassification::TaskRaised => "task raised",
            ErrorClassification::HarnessCrashed => "harness crashed",
            ErrorClassification::TimedOut => "timed out",
            ErrorClassification::KilledBySignal => "killed by signal",
            ErrorClassification::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// The outcome recorded for a single quantum at the end of its life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumReport {
    pub index: usize,
    pub label: String,
    pub state: NodeState,
    pub message: String,
    /// Set only for terminal states reached via a worker process.
    pub exit_code: Option<i32>,
    /// Set only for non-`Succeeded` terminals.
    pub classification: Option<ErrorClassification>,
    /// Free-form detail returned by the executor's own `getReport`, if any.
    pub executor_detail: Option<String>,
}

impl QuantumReport {
    pub fn succeeded(index: usize, label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            label: label.into(),
            state: NodeState::Succeeded,
            message: message.into(),
            exit_code: None,
            classification: None,
            executor_detail: None,
        }
    }

    pub fn skipped(index: usize, label: impl Into<String>, cause: usize) -> Self {
        Self {
            index,
            label: label.into(),
            state: NodeState::Skipped,
            message: format!("skipped: predecessor {} did not succeed", cause),
            exit_code: None,
            classification: Some(ErrorClassification::Skipped),
            executor_detail: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

impl fmt::Display for QuantumReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] -> {}: {}", self.label, self.index, self.state, self.message)
    }
}

/// Overall outcome of a run, independent of which error (if any) was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    AllSucceeded,
    SomeTimedOut,
    SomeFailed,
}

/// Aggregates every quantum report produced during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    quanta: Vec<QuantumReport>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, report: QuantumReport) {
        self.quanta.push(report);
    }

    pub fn quanta(&self) -> &[QuantumReport] {
        &self.quanta
    }

    pub fn len(&self) -> usize {
        self.quanta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quanta.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.quanta.iter().all(QuantumReport::is_success)
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.quanta.iter().any(|r| r.state == NodeState::TimedOut) {
            RunOutcome::SomeTimedOut
        } else if !self.all_succeeded() {
            RunOutcome::SomeFailed
        } else {
            RunOutcome::AllSucceeded
        }
    }

    /// The first report that did not succeed, in the order the coordinator observed it.
    pub fn first_failure(&self) -> Option<&QuantumReport> {
        self.quanta.iter().find(|r| !r.is_success())
    }
}
