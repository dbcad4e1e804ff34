//! The scheduler's own error taxonomy, wrapped in `qgraph_core`'s payload error.

use qgraph_core::report::RunReport;
use qgraph_core::PayloadError;
use thiserror::Error;

/// Errors the scheduler itself raises, as opposed to a single task's failure
/// (which is recorded in the `Report`, not raised).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Parallelism requested against a task that does not support it, or
    /// `pdb` requested together with `num_proc > 1`. Raised before any dispatch.
    #[error("{0}")]
    Configuration(String),

    /// The graph (possibly after a fixup) is not acyclic.
    #[error("cycle detected among nodes {nodes:?}")]
    Cycle { nodes: Vec<usize> },

    /// At least one node was terminated for exceeding its per-worker deadline.
    #[error("{count} node(s) exceeded their per-worker deadline")]
    Timeout { count: usize, report: RunReport },

    /// One or more nodes terminated `Failed`/`Skipped`.
    #[error("{} node(s) did not succeed", report.quanta().iter().filter(|q| !q.is_success()).count())]
    GraphExecution { report: RunReport },

    #[error(transparent)]
    Fixup(#[from] qgraph_core::FixupError),
}

pub type SchedulerResult<T> = Result<T, PayloadError<SchedulerError>>;
