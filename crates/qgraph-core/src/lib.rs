//! # `qgraph-core`
//!
//! Data model and polymorphic interfaces shared by the quantum graph execution core:
//! the quantum/task definitions, the graph view, node lifecycle, report structures,
//! and the `QuantumExecutor` / `ExecutionGraphFixup` interfaces that the scheduler
//! in `qgraph-exec` drives.
//!
//! This crate owns no scheduling policy; it only defines the shapes that the
//! scheduler and its collaborators agree on.

#[macro_use]
extern crate log;

pub mod error;
pub mod executor;
pub mod fixup;
pub mod graph;
pub mod logging;
pub mod quantum;
pub mod report;
pub mod state;

pub use error::{GraphError, PayloadError};
pub use executor::{ExecutorError, QuantumExecutor};
pub use fixup::{ExecutionGraphFixup, FixupError, OrderByDataIdField};
pub use graph::{Graph, GraphView};
pub use quantum::{ExternalContext, QuantumNode, QuantumPayload, TaskDef};
pub use report::{ErrorClassification, QuantumReport, RunOutcome, RunReport};
pub use state::NodeState;

pub mod prelude {
    //! The small set of types most call sites need.
    pub use crate::error::{GraphError, PayloadError};
    pub use crate::executor::{ExecutorError, QuantumExecutor};
    pub use crate::fixup::{ExecutionGraphFixup, FixupError, OrderByDataIdField};
    pub use crate::graph::{Graph, GraphView};
    pub use crate::quantum::{ExternalContext, QuantumNode, QuantumPayload, TaskDef};
    pub use crate::report::{ErrorClassification, QuantumReport, RunOutcome, RunReport};
    pub use crate::state::NodeState;
}
