#![deny(rustdoc::broken_intra_doc_links)]

//! `qgraph-exec` is the multiprocess graph executor built on top of
//! `qgraph-core`'s data model: it walks a quantum graph, dispatches ready
//! nodes to in-process calls or worker processes, enforces per-worker
//! timeouts, and applies fail-fast or run-to-completion failure policy.
//!
//! Binaries that drive a scheduler should call [`worker::run_worker_if_requested`]
//! at the very top of `main()`, before doing anything else, so a `spawn`
//! worker re-exec is handled before any coordinator setup runs.

#[macro_use]
extern crate log;

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod worker;

pub use aggregator::ReportAggregator;
pub use cli::SchedulerArgs;
pub use config::{PdbSpec, SchedulerConfig, StartMethod};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
pub use worker::{run_worker_if_requested, WorkerEntryPoint};

pub mod prelude {
    //! Everything a binary embedding this scheduler typically needs.
    pub use crate::{
        PdbSpec, ReportAggregator, Scheduler, SchedulerArgs, SchedulerConfig, SchedulerError,
        SchedulerResult, StartMethod,
    };
    pub use qgraph_core::prelude::*;
}
