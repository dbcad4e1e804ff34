//! Applies the canonical data-id fixup to chain same-label nodes, then runs
//! them across a small worker pool using the `fork` start method.

use qgraph_core::executor::{InMemoryAppender, RecordingExecutor};
use qgraph_core::quantum::{ExternalContext, QuantumNode, QuantumPayload, TaskDef};
use qgraph_core::{Graph, OrderByDataIdField};
use qgraph_exec::config::StartMethod;
use qgraph_exec::{Scheduler, SchedulerConfig};
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    qgraph_core::logging::init_root_log(log::LevelFilter::Info, None);

    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = (0..4)
        .map(|detector| {
            QuantumNode::new(detector, task.clone(), QuantumPayload(json!({ "detector": detector })), [])
        })
        .collect();
    let graph = Graph::new(nodes).expect("four independent nodes always build");

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let config = SchedulerConfig::new(NonZeroUsize::new(2).unwrap(), Duration::from_secs(5))
        .with_start_method(StartMethod::Fork);
    let mut scheduler = Scheduler::new(config, executor)
        .with_fixup(Arc::new(OrderByDataIdField::new("task1", "detector", false)));

    scheduler.execute(&graph, &ExternalContext::default()).expect("run succeeds");
    let report = scheduler.report().expect("execute always populates a report");
    for quantum_report in report.quanta() {
        println!("{quantum_report}");
    }
}
