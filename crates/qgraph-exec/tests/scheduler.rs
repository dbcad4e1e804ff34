//! End-to-end scheduler scenarios, one per behavior called out by the design:
//! straight-line serial execution, parallel dispatch, the unsupported-
//! parallelism guard, fixup-driven ordering, timeouts under both failure
//! policies, and cascading skip propagation.

use qgraph_core::executor::{InMemoryAppender, RecordingExecutor};
use qgraph_core::quantum::{ExternalContext, QuantumNode, QuantumPayload, TaskDef};
use qgraph_core::state::NodeState;
use qgraph_core::{Graph, OrderByDataIdField};
use qgraph_exec::config::StartMethod;
use qgraph_exec::{Scheduler, SchedulerConfig, SchedulerError};
use serde_json::json;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

fn detector_node(index: usize, task: &Arc<TaskDef>, detector: i64) -> QuantumNode {
    QuantumNode::new(index, task.clone(), QuantumPayload(json!({ "detector": detector })), [])
}

fn serial_config(timeout_secs: u64) -> SchedulerConfig {
    SchedulerConfig::new(NonZeroUsize::new(1).unwrap(), Duration::from_secs(timeout_secs))
}

#[test]
fn straight_line_happy_path_serial() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = (0..3).map(|i| detector_node(i, &task, i as i64)).collect();
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let mut scheduler = Scheduler::new(serial_config(100), executor);

    scheduler.execute(&graph, &ExternalContext::default()).expect("all three succeed");
    let report = scheduler.report().unwrap();
    assert_eq!(report.quanta().iter().map(|q| q.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(report.all_succeeded());
}

#[test]
#[cfg(unix)]
fn parallel_happy_path_fork() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = (0..3).map(|i| detector_node(i, &task, i as i64)).collect();
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let config = SchedulerConfig::new(NonZeroUsize::new(3).unwrap(), Duration::from_secs(30))
        .with_start_method(StartMethod::Fork);
    let mut scheduler = Scheduler::new(config, executor);

    scheduler.execute(&graph, &ExternalContext::default()).expect("all three succeed");
    let report = scheduler.report().unwrap();
    let detectors: HashSet<usize> = report.quanta().iter().map(|q| q.index).collect();
    assert_eq!(detectors, HashSet::from([0, 1, 2]));
    assert!(report.all_succeeded());
}

#[test]
fn unsupported_parallelism_is_rejected_before_dispatch() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask").without_multiprocess());
    let nodes = (0..3).map(|i| detector_node(i, &task, i as i64)).collect();
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let config = SchedulerConfig::new(NonZeroUsize::new(3).unwrap(), Duration::from_secs(5));
    let mut scheduler = Scheduler::new(config, executor);

    let err = scheduler.execute(&graph, &ExternalContext::default()).unwrap_err();
    assert!(matches!(err.kind(), SchedulerError::Configuration(_)));
    assert!(scheduler.report().expect("report is always populated").is_empty());
}

#[test]
fn fixup_orders_by_reversed_detector() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = (0..3).map(|i| detector_node(i, &task, i as i64)).collect();
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let mut scheduler = Scheduler::new(serial_config(100), executor)
        .with_fixup(Arc::new(OrderByDataIdField::new("task1", "detector", true)));

    scheduler.execute(&graph, &ExternalContext::default()).expect("all three succeed");
    let report = scheduler.report().unwrap();
    assert_eq!(report.quanta().iter().map(|q| q.index).collect::<Vec<_>>(), vec![2, 1, 0]);
}

#[test]
#[cfg(unix)]
fn fail_fast_timeout_raises_quickly() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = vec![
        detector_node(0, &task, 0),
        detector_node(1, &task, 1),
        detector_node(2, &task, 2),
    ];
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(
        RecordingExecutor::new(appender).sleeping([("task1", Duration::from_secs(100))]),
    );
    let config = SchedulerConfig::new(NonZeroUsize::new(3).unwrap(), Duration::from_secs(1))
        .with_start_method(StartMethod::Fork)
        .with_fail_fast(true);
    let mut scheduler = Scheduler::new(config, executor);

    let started = std::time::Instant::now();
    let err = scheduler.execute(&graph, &ExternalContext::default()).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10), "fail-fast must not wait for the full sleep");
    assert!(matches!(err.kind(), SchedulerError::Timeout { .. }));
}

#[test]
#[cfg(unix)]
fn non_fail_fast_timeout_reports_at_end() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    // Every quantum shares the label `task1`, so the sleeping executor would
    // stall every one of them; exercise only the node that actually sleeps.
    let nodes = vec![
        QuantumNode::new(0, Arc::new(TaskDef::new("fast", "demo::OkTask")), QuantumPayload(json!({"detector":0})), []),
        QuantumNode::new(1, task.clone(), QuantumPayload(json!({"detector":1})), []),
        QuantumNode::new(2, Arc::new(TaskDef::new("fast", "demo::OkTask")), QuantumPayload(json!({"detector":2})), []),
    ];
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(
        RecordingExecutor::new(appender).sleeping([("task1", Duration::from_secs(100))]),
    );
    let config = SchedulerConfig::new(NonZeroUsize::new(3).unwrap(), Duration::from_secs(3))
        .with_start_method(StartMethod::Fork)
        .with_fail_fast(false);
    let mut scheduler = Scheduler::new(config, executor);

    let err = scheduler.execute(&graph, &ExternalContext::default()).unwrap_err();
    assert!(matches!(err.kind(), SchedulerError::Timeout { .. }));
    let report = scheduler.report().unwrap();
    let succeeded: HashSet<usize> =
        report.quanta().iter().filter(|q| q.is_success()).map(|q| q.index).collect();
    assert!(succeeded.is_subset(&HashSet::from([0, 2])));
}

#[test]
fn cascading_skip_on_failure() {
    // edges: 1->2, 3->4, 2->4; node 1 fails.
    let ok = Arc::new(TaskDef::new("ok", "demo::OkTask"));
    let failing = Arc::new(TaskDef::new("boom", "demo::FailTask"));
    let nodes = vec![
        QuantumNode::new(0, ok.clone(), QuantumPayload(json!({"detector": 0})), []),
        QuantumNode::new(1, failing.clone(), QuantumPayload(json!({"detector": 1})), []),
        QuantumNode::new(2, ok.clone(), QuantumPayload(json!({"detector": 2})), [1]),
        QuantumNode::new(3, ok.clone(), QuantumPayload(json!({"detector": 3})), []),
        QuantumNode::new(4, ok.clone(), QuantumPayload(json!({"detector": 4})), [2, 3]),
    ];
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender).failing(["boom"]));
    let mut scheduler = Scheduler::new(serial_config(10), executor);

    let err = scheduler.execute(&graph, &ExternalContext::default()).unwrap_err();
    assert!(matches!(err.kind(), SchedulerError::GraphExecution { .. }));
    let report = scheduler.report().unwrap();

    let succeeded: HashSet<usize> =
        report.quanta().iter().filter(|q| q.is_success()).map(|q| q.index).collect();
    assert_eq!(succeeded, HashSet::from([0, 3]));

    let state_of = |index: usize| report.quanta().iter().find(|q| q.index == index).unwrap().state;
    assert_eq!(state_of(2), NodeState::Skipped);
    assert_eq!(state_of(4), NodeState::Skipped);
}

#[test]
#[cfg(unix)]
fn fail_fast_records_a_terminal_report_for_in_flight_workers_too() {
    // node 0 fails immediately; node 1 is still running (sleeping) when that
    // failure triggers fail-fast teardown. Every node must still get exactly
    // one terminal report (dispatch uniqueness holds for cancelled nodes).
    let boom = Arc::new(TaskDef::new("boom", "demo::FailTask"));
    let sleeper = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = vec![
        QuantumNode::new(0, boom, QuantumPayload(json!({"detector": 0})), []),
        QuantumNode::new(1, sleeper, QuantumPayload(json!({"detector": 1})), []),
    ];
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(
        RecordingExecutor::new(appender)
            .failing(["boom"])
            .sleeping([("task1", Duration::from_secs(100))]),
    );
    let config = SchedulerConfig::new(NonZeroUsize::new(2).unwrap(), Duration::from_secs(60))
        .with_start_method(StartMethod::Fork)
        .with_fail_fast(true);
    let mut scheduler = Scheduler::new(config, executor);

    let started = std::time::Instant::now();
    let err = scheduler.execute(&graph, &ExternalContext::default()).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10), "fail-fast must not wait for the full sleep");
    assert!(matches!(err.kind(), SchedulerError::GraphExecution { .. }));

    let report = scheduler.report().unwrap();
    assert_eq!(report.quanta().len(), 2, "every node gets exactly one terminal report");
    let state_of = |index: usize| report.quanta().iter().find(|q| q.index == index).unwrap().state;
    assert_eq!(state_of(0), NodeState::Failed);
    assert_eq!(state_of(1), NodeState::Failed);
}

#[test]
fn empty_graph_returns_immediately() {
    let graph = Graph::new(vec![]).unwrap();
    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let mut scheduler = Scheduler::new(serial_config(10), executor);

    scheduler.execute(&graph, &ExternalContext::default()).expect("empty graph is trivially successful");
    let report = scheduler.report().unwrap();
    assert!(report.is_empty());
}

#[test]
fn rerunning_the_same_graph_yields_the_same_successes() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = || (0..3).map(|i| detector_node(i, &task, i as i64)).collect();

    let run_once = || {
        let appender = Arc::new(InMemoryAppender::new());
        let executor = Arc::new(RecordingExecutor::new(appender));
        let mut scheduler = Scheduler::new(serial_config(10), executor);
        let graph = Graph::new(nodes()).unwrap();
        scheduler.execute(&graph, &ExternalContext::default()).unwrap();
        let report = scheduler.report().unwrap().clone();
        report.quanta().iter().filter(|q| q.is_success()).map(|q| q.index).collect::<HashSet<_>>()
    };

    assert_eq!(run_once(), run_once());
}

#[test]
fn pdb_propagates_the_original_error_as_a_panic_instead_of_classifying() {
    use qgraph_exec::PdbSpec;

    let failing = Arc::new(TaskDef::new("boom", "demo::FailTask"));
    let nodes = vec![QuantumNode::new(0, failing, QuantumPayload(json!({"detector": 0})), [])];
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender).failing(["boom"]));
    let config = serial_config(10).with_pdb(Some(PdbSpec::new("pdb")));
    let mut scheduler = Scheduler::new(config, executor);

    let result =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| scheduler.execute(&graph, &ExternalContext::default())));
    assert!(result.is_err(), "a pdb-configured failure must propagate, not classify into the report");
}

/// Open descriptor count of the current process, via `/proc/self/fd`. Only
/// meaningful on Linux; used to check the descriptor-conservation property
/// rather than a hard exact-count assertion, since other concurrently
/// running tests in the same binary share this process.
#[cfg(target_os = "linux")]
fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").map(|entries| entries.count()).unwrap_or(0)
}

#[test]
#[cfg(target_os = "linux")]
fn descriptor_count_does_not_grow_with_dispatch_count() {
    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = (0..20).map(|i| detector_node(i, &task, i as i64)).collect();
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender));
    let config = SchedulerConfig::new(NonZeroUsize::new(4).unwrap(), Duration::from_secs(30))
        .with_start_method(StartMethod::Fork);
    let mut scheduler = Scheduler::new(config, executor);

    let before = open_fd_count();
    scheduler.execute(&graph, &ExternalContext::default()).expect("all twenty succeed");
    let after = open_fd_count();

    assert!(
        after <= before + 5,
        "open descriptors grew from {before} to {after} dispatching 20 nodes across 4 workers"
    );
}

#[test]
fn executor_report_is_folded_into_executor_detail() {
    use qgraph_core::report::QuantumReport;

    let task = Arc::new(TaskDef::new("task1", "demo::OkTask"));
    let nodes = vec![detector_node(0, &task, 0)];
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(
        RecordingExecutor::new(appender)
            .reporting(QuantumReport::succeeded(0, "task1", "extra detail from the executor")),
    );
    let mut scheduler = Scheduler::new(serial_config(10), executor);

    scheduler.execute(&graph, &ExternalContext::default()).expect("the single node succeeds");
    let report = scheduler.report().unwrap();
    let detail = report.quanta()[0].executor_detail.as_deref().expect("executor's own report was consulted");
    assert!(detail.contains("extra detail from the executor"));
}

#[test]
#[cfg(unix)]
fn forked_worker_failure_carries_the_observed_exit_code() {
    // `run_forked_child` always exits 0 after writing its response, whether
    // the task raised or not, so a task-raised failure dispatched via `fork`
    // is expected to carry exit code 0 rather than the field staying `None`.
    let task = Arc::new(TaskDef::new("boom", "demo::FailTask"));
    let nodes = vec![QuantumNode::new(0, task, QuantumPayload(json!({"detector": 0})), [])];
    let graph = Graph::new(nodes).unwrap();

    let appender = Arc::new(InMemoryAppender::new());
    let executor = Arc::new(RecordingExecutor::new(appender).failing(["boom"]));
    let config = SchedulerConfig::new(NonZeroUsize::new(1).unwrap(), Duration::from_secs(10))
        .with_start_method(StartMethod::Fork);
    let mut scheduler = Scheduler::new(config, executor);

    let err = scheduler.execute(&graph, &ExternalContext::default()).unwrap_err();
    assert!(matches!(err.kind(), SchedulerError::GraphExecution { .. }));
    let report = scheduler.report().unwrap();
    assert_eq!(report.quanta()[0].exit_code, Some(0));
}

// No-zombies is not covered by a dedicated `waitpid(-1, ...)` test here: that
// call reaps *any* child of the test process, including ones started by
// other tests in this binary running concurrently on the default
// multi-threaded test runner, which would make such a test race instead of
// reliably pass. The property is still exercised indirectly — every
// `ForkHandle`/`SpawnHandle`/`ForkServer`'s `Drop` impl reaps its own child
// if still alive, and every fork-based test above (including the fail-fast
// teardown ones) would hang or error on drop if a handle failed to do so.
