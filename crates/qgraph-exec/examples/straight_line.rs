//! Three independent quanta, run serially, then again across three workers.

use qgraph_core::executor::{InMemoryAppender, RecordingExecutor};
use qgraph_core::quantum::{ExternalContext, QuantumNode, QuantumPayload, TaskDef};
use qgraph_core::Graph;
use qgraph_exec::{Scheduler, SchedulerConfig};
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

fn graph() -> Graph {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = (0..3)
        .map(|detector| {
            QuantumNode::new(detector, task.clone(), QuantumPayload(json!({ "detector": detector })), [])
        })
        .collect();
    Graph::new(nodes).expect("three independent nodes always build")
}

fn main() {
    qgraph_core::logging::init_root_log(log::LevelFilter::Info, None);

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let mut scheduler = Scheduler::new(SchedulerConfig::new(NonZeroUsize::new(1).unwrap(), Duration::from_secs(5)), executor);

    scheduler.execute(&graph(), &ExternalContext::default()).expect("serial run succeeds");
    let report = scheduler.report().expect("execute always populates a report");
    for quantum_report in report.quanta() {
        println!("{quantum_report}");
    }
}
