//! The graph executor: ready-queue management, worker dispatch, and
//! timeout/failure policy. Everything else in this crate exists to serve
//! this loop.

use crate::aggregator::ReportAggregator;
use crate::config::{SchedulerConfig, StartMethod};
use crate::error::SchedulerError;
use crate::worker::{WorkerHandle, WorkerHarness, WorkerOutcome};
use qgraph_core::executor::QuantumExecutor;
use qgraph_core::fixup::ExecutionGraphFixup;
use qgraph_core::graph::{Graph, GraphView};
use qgraph_core::quantum::ExternalContext;
use qgraph_core::report::{ErrorClassification, QuantumReport};
use qgraph_core::state::NodeState;
use qgraph_core::PayloadError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Waits are re-polled on this quantum so cancellation, timeout expiry, and
/// completion are all observable; not part of the public contract.
const POLL_QUANTUM: Duration = Duration::from_millis(10);

/// Drives one run of a quantum graph to completion.
///
/// `new` takes ownership of the config and executor; `execute` borrows the
/// graph view and never mutates it, consuming instead the fixup's owned
/// replacement when one is configured.
pub struct Scheduler {
    config: SchedulerConfig,
    executor: Arc<dyn QuantumExecutor>,
    fixup: Option<Arc<dyn ExecutionGraphFixup>>,
    harness: WorkerHarness,
    last_report: Option<qgraph_core::report::RunReport>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn QuantumExecutor>) -> Self {
        let harness = WorkerHarness::new(executor.clone());
        Self { config, executor, fixup: None, harness, last_report: None }
    }

    pub fn with_fixup(mut self, fixup: Arc<dyn ExecutionGraphFixup>) -> Self {
        self.fixup = Some(fixup);
        self
    }

    /// The full report from the last call to `execute`, including on failure.
    pub fn report(&self) -> Option<&qgraph_core::report::RunReport> {
        self.last_report.as_ref()
    }

    pub fn execute(
        &mut self,
        graph: &dyn GraphView,
        context: &ExternalContext,
    ) -> Result<(), PayloadError<SchedulerError>> {
        let start_instant = Instant::now();
        self.last_report = Some(qgraph_core::report::RunReport::new());
        debug!(
            "executing quantum graph of {} node(s) with num_proc={} start_method={:?} fail_fast={}",
            graph.size(), self.config.num_proc, self.config.start_method, self.config.fail_fast
        );

        let owned_fixed: Option<Graph> = match &self.fixup {
            Some(fixup) => {
                trace!("applying execution graph fixup before scheduling");
                Some(fixup.apply(graph).map_err(SchedulerError::from)?)
            }
            None => None,
        };
        let view: &dyn GraphView = owned_fixed.as_ref().map(|g| g as &dyn GraphView).unwrap_or(graph);

        let cycle = view.find_cycle();
        if !cycle.is_empty() {
            error!("cycle detected among nodes {cycle:?}; aborting before any dispatch");
            return Err(SchedulerError::Cycle { nodes: cycle }.into());
        }

        if self.config.pdb.is_some() && self.config.num_proc.get() > 1 {
            return Err(SchedulerError::Configuration(
                "pdb requires num_proc == 1".to_string(),
            )
            .into());
        }
        if self.config.num_proc.get() > 1 {
            for index in view.indices() {
                let node = view.node(index).expect("index came from indices()");
                if !node.task_def.supports_multiprocess {
                    return Err(SchedulerError::Configuration(format!(
                        "node {index} (label {:?}) does not support multiprocess execution, but num_proc > 1",
                        node.task_def.label
                    ))
                    .into());
                }
            }
        }

        let aggregator = ReportAggregator::new();
        let result = self.run_loop(view, context, &aggregator);
        let report = aggregator.finish();
        self.last_report = Some(report.clone());

        let elapsed = start_instant.elapsed().as_secs_f32();
        match result {
            Ok(()) => {
                if report.all_succeeded() {
                    info!("quantum graph execution finished in {elapsed:.3} sec, {} node(s) succeeded", report.len());
                    Ok(())
                } else {
                    warn!("quantum graph execution finished in {elapsed:.3} sec with failures");
                    Err(SchedulerError::GraphExecution { report }.into())
                }
            }
            Err(LoopOutcome::TimedOut(count)) => {
                warn!("quantum graph execution timed out after {elapsed:.3} sec ({count} node(s) exceeded their deadline)");
                Err(SchedulerError::Timeout { count, report }.into())
            }
            Err(LoopOutcome::FailFast) => {
                warn!("quantum graph execution stopped early by fail-fast after {elapsed:.3} sec");
                Err(SchedulerError::GraphExecution { report }.into())
            }
            Err(LoopOutcome::Raised(e)) => Err(e),
        }
    }

    fn run_loop(
        &mut self,
        view: &dyn GraphView,
        context: &ExternalContext,
        aggregator: &ReportAggregator,
    ) -> Result<(), LoopOutcome> {
        let mut states: HashMap<usize, NodeState> =
            view.indices().into_iter().map(|i| (i, NodeState::Pending)).collect();
        let mut running: HashMap<usize, Box<dyn WorkerHandle>> = HashMap::new();
        let mut timed_out_count = 0usize;

        if states.is_empty() {
            return Ok(());
        }

        // Stable (sorted) order for the initial frontier; later arrivals are
        // appended in the order the coordinator observes them.
        let mut initial_ready: Vec<usize> =
            states.keys().copied().filter(|&i| view.dependencies_of(i).is_empty()).collect();
        initial_ready.sort_unstable();
        let mut ready: VecDeque<usize> = initial_ready.into_iter().collect();
        for &index in &ready {
            states.insert(index, NodeState::Ready);
        }

        loop {
            // Fill.
            while running.len() < self.config.num_proc.get() {
                let Some(index) = ready.pop_front() else { break };
                states.insert(index, NodeState::Running);
                let node = view.node(index).expect("ready node must exist");
                debug!("dispatching node {index} (label {:?})", node.task_def.label);

                if self.config.is_serial() {
                    let report = self.dispatch_in_process(index, &node.task_def, node.quantum.clone(), context);
                    if let Some(stop) = self.handle_completion(
                        index,
                        report,
                        view,
                        &mut states,
                        &mut ready,
                        &mut running,
                        aggregator,
                        &mut timed_out_count,
                    )? {
                        return Err(stop);
                    }
                } else {
                    match self.dispatch_worker(&node.task_def, node.quantum.clone(), context) {
                        Ok(handle) => {
                            running.insert(index, handle);
                        }
                        Err(message) => {
                            let report = QuantumReport {
                                index,
                                label: node.task_def.label.clone(),
                                state: NodeState::Failed,
                                message,
                                exit_code: None,
                                classification: Some(ErrorClassification::HarnessCrashed),
                                executor_detail: None,
                            };
                            if let Some(stop) = self.handle_completion(
                                index,
                                report,
                                view,
                                &mut states,
                                &mut ready,
                                &mut running,
                                aggregator,
                                &mut timed_out_count,
                            )? {
                                return Err(stop);
                            }
                        }
                    }
                }
            }

            if running.is_empty() && ready.is_empty() {
                break;
            }
            if running.is_empty() {
                continue;
            }

            // Wait: poll every running worker on a small quantum until one
            // completes or its per-worker deadline elapses.
            let completed = loop {
                let mut finished = Vec::new();
                let mut timed_out = Vec::new();
                for (&index, handle) in running.iter_mut() {
                    if let Some(outcome) = handle.poll() {
                        finished.push((index, outcome));
                        continue;
                    }
                    if handle.dispatched_at().elapsed() >= self.config.timeout {
                        timed_out.push(index);
                    }
                }
                if !finished.is_empty() || !timed_out.is_empty() {
                    break (finished, timed_out);
                }
                std::thread::sleep(POLL_QUANTUM);
            };

            let (finished, timed_out) = completed;
            for index in &timed_out {
                if let Some(mut handle) = running.remove(index) {
                    // The timeout classification wins regardless of what
                    // `terminate` itself observed (it may race and see the
                    // worker exit cleanly right as the deadline trips).
                    let _ = handle.terminate();
                    let node = view.node(*index).expect("running node must exist");
                    let report = QuantumReport {
                        index: *index,
                        label: node.task_def.label.clone(),
                        state: NodeState::TimedOut,
                        message: format!("worker exceeded its {:?} deadline", self.config.timeout),
                        exit_code: None,
                        classification: Some(ErrorClassification::TimedOut),
                        executor_detail: None,
                    };
                    if let Some(stop) = self.handle_completion(
                        *index,
                        report,
                        view,
                        &mut states,
                        &mut ready,
                        &mut running,
                        aggregator,
                        &mut timed_out_count,
                    )? {
                        return Err(stop);
                    }
                }
            }
            for (index, outcome) in finished {
                running.remove(&index);
                let node = view.node(index).expect("running node must exist");
                let report = outcome_to_report(index, &node.task_def.label, outcome);
                if let Some(stop) = self.handle_completion(
                    index,
                    report,
                    view,
                    &mut states,
                    &mut ready,
                    &mut running,
                    aggregator,
                    &mut timed_out_count,
                )? {
                    return Err(stop);
                }
            }
        }

        if timed_out_count > 0 {
            return Err(LoopOutcome::TimedOut(timed_out_count));
        }
        Ok(())
    }

    /// Records one terminal transition, recomputes successor readiness
    /// (cascading skips), and applies fail-fast policy. Returns `Some` when
    /// the loop must stop immediately.
    #[allow(clippy::too_many_arguments)]
    fn handle_completion(
        &mut self,
        index: usize,
        mut report: QuantumReport,
        view: &dyn GraphView,
        states: &mut HashMap<usize, NodeState>,
        ready: &mut VecDeque<usize>,
        running: &mut HashMap<usize, Box<dyn WorkerHandle>>,
        aggregator: &ReportAggregator,
        timed_out_count: &mut usize,
    ) -> Result<Option<LoopOutcome>, LoopOutcome> {
        self.fold_executor_detail(&mut report);
        let succeeded = report.is_success();
        let is_timeout = report.state == NodeState::TimedOut;
        if succeeded {
            debug!("node {index} ({}) succeeded", report.label);
        } else {
            warn!("node {index} ({}) ended {}: {}", report.label, report.state, report.message);
        }
        states.insert(index, report.state);
        aggregator.record(report);

        for successor in qgraph_core::graph::successors_of_view(view, index) {
            if states.get(&successor).map(|s| s.is_terminal()).unwrap_or(true) {
                continue;
            }
            let deps = view.dependencies_of(successor);
            let bad_dep = deps.iter().copied().find(|d| {
                states
                    .get(d)
                    .map(|s| matches!(s, NodeState::Failed | NodeState::TimedOut | NodeState::Skipped))
                    .unwrap_or(false)
            });
            if let Some(cause) = bad_dep {
                skip_cascading(successor, cause, view, states, aggregator);
            } else if deps.iter().all(|d| states.get(d).map(|s| *s == NodeState::Succeeded).unwrap_or(false)) {
                states.insert(successor, NodeState::Ready);
                ready.push_back(successor);
            }
        }

        if is_timeout {
            *timed_out_count += 1;
        }

        if !succeeded && self.config.fail_fast {
            warn!("fail-fast: tearing down {} still-running worker(s) after node {index} failed", running.len());
            // Every still-running worker gets exactly one terminal report too
            // (dispatch uniqueness holds for cancelled nodes, not just ones
            // that ran to completion): `terminate` itself classifies how it
            // ended, rather than the cancelling node's index standing in.
            for (cancelled_index, mut handle) in running.drain() {
                let outcome = handle.terminate();
                let node = view.node(cancelled_index).expect("running node must exist");
                let mut cancelled_report = outcome_to_report(cancelled_index, &node.task_def.label, outcome);
                self.fold_executor_detail(&mut cancelled_report);
                states.insert(cancelled_index, cancelled_report.state);
                aggregator.record(cancelled_report);
            }
            let pending: Vec<usize> = states
                .iter()
                .filter(|(_, s)| matches!(s, NodeState::Pending | NodeState::Ready))
                .map(|(&i, _)| i)
                .collect();
            for pending_index in pending {
                let node = view.node(pending_index).expect("pending node must exist");
                states.insert(pending_index, NodeState::Skipped);
                aggregator.record(QuantumReport::skipped(pending_index, node.task_def.label.clone(), index));
            }
            ready.clear();
            return Ok(Some(if is_timeout {
                LoopOutcome::TimedOut(*timed_out_count)
            } else {
                LoopOutcome::FailFast
            }));
        }

        Ok(None)
    }

    /// Consults the in-process executor's own `getReport()` (§4.1) after a
    /// node's terminal transition and folds it into `executor_detail` when
    /// the executor has something to say and the report doesn't already
    /// carry detail of its own.
    fn fold_executor_detail(&self, report: &mut QuantumReport) {
        if report.executor_detail.is_some() {
            return;
        }
        if let Some(executor_report) = self.executor.report() {
            report.executor_detail = Some(executor_report.to_string());
        }
    }

    /// In-process dispatch (`num_proc == 1`). When `pdb` is configured the
    /// original error is propagated as a panic rather than folded into a
    /// `Failed` report: Rust has no REPL-style debugger to drop into the way
    /// the source language does, so a panic carrying the task's own message
    /// (catchable by `rust-gdb`/`rust-lldb` or a `RUST_BACKTRACE=1` run) is
    /// this crate's equivalent of "propagate the original exception to
    /// enable debugging" from the propagation policy.
    fn dispatch_in_process(
        &self,
        index: usize,
        task_def: &qgraph_core::quantum::TaskDef,
        quantum: qgraph_core::quantum::QuantumPayload,
        context: &ExternalContext,
    ) -> QuantumReport {
        match self.executor.execute(task_def, quantum, context) {
            Ok(_) => QuantumReport::succeeded(index, task_def.label.clone(), "ok"),
            Err(e) => {
                if let Some(pdb) = &self.config.pdb {
                    error!(
                        "node {index} (label {:?}) raised with pdb={:?} configured; propagating instead of classifying",
                        task_def.label, pdb.debugger
                    );
                    panic!(
                        "task {:?} (node {index}) raised: {} (pdb={:?})",
                        task_def.label, e.message, pdb.debugger
                    );
                }
                QuantumReport {
                    index,
                    label: task_def.label.clone(),
                    state: NodeState::Failed,
                    message: e.message,
                    exit_code: None,
                    classification: Some(ErrorClassification::TaskRaised),
                    executor_detail: None,
                }
            }
        }
    }

    fn dispatch_worker(
        &mut self,
        task_def: &qgraph_core::quantum::TaskDef,
        quantum: qgraph_core::quantum::QuantumPayload,
        context: &ExternalContext,
    ) -> Result<Box<dyn WorkerHandle>, String> {
        match self.config.start_method {
            StartMethod::Spawn => self
                .harness
                .dispatch_spawn(task_def, quantum, context)
                .map_err(|e| format!("could not spawn worker: {e}")),
            #[cfg(unix)]
            StartMethod::Fork => self
                .harness
                .dispatch_fork(task_def, quantum, context)
                .map_err(|e| format!("could not fork worker: {e}")),
            #[cfg(unix)]
            StartMethod::ForkServer => self
                .harness
                .dispatch_forkserver(task_def, quantum, context)
                .map_err(|e| format!("could not dispatch to fork server: {e}")),
            #[cfg(not(unix))]
            StartMethod::Fork | StartMethod::ForkServer => {
                Err("fork/forkserver start methods are POSIX-only".to_string())
            }
        }
    }
}

/// Why `run_loop` stopped short of a clean end-of-frontier finish.
enum LoopOutcome {
    TimedOut(usize),
    FailFast,
    Raised(PayloadError<SchedulerError>),
}

impl From<PayloadError<SchedulerError>> for LoopOutcome {
    fn from(e: PayloadError<SchedulerError>) -> Self {
        LoopOutcome::Raised(e)
    }
}

/// Recursively marks `index` and everything reachable from it `Skipped`,
/// since a predecessor chain that never succeeded means none of them will
/// ever be dispatched.
fn skip_cascading(
    index: usize,
    cause: usize,
    view: &dyn GraphView,
    states: &mut HashMap<usize, NodeState>,
    aggregator: &ReportAggregator,
) {
    let Some(state) = states.get(&index).copied() else { return };
    if state.is_terminal() {
        return;
    }
    let node = view.node(index).expect("index came from the graph");
    debug!("skipping node {index} ({}): predecessor {cause} did not succeed", node.task_def.label);
    states.insert(index, NodeState::Skipped);
    aggregator.record(QuantumReport::skipped(index, node.task_def.label.clone(), cause));
    for successor in qgraph_core::graph::successors_of_view(view, index) {
        skip_cascading(successor, index, view, states, aggregator);
    }
}

fn outcome_to_report(index: usize, label: &str, outcome: WorkerOutcome) -> QuantumReport {
    match outcome {
        WorkerOutcome::Success(_) => QuantumReport::succeeded(index, label, "ok"),
        WorkerOutcome::Failure { classification, message, exit_code } => QuantumReport {
            index,
            label: label.to_string(),
            state: NodeState::Failed,
            message,
            exit_code,
            classification: Some(classification),
            executor_detail: None,
        },
    }
}
