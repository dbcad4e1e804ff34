//! Appends a `QuantumReport` per terminal transition and exposes the full
//! `RunReport` once a run ends. Single-writer (the scheduler); thread-safe
//! only so the same type can back both the in-process and worker-observed paths.

use parking_lot::Mutex;
use qgraph_core::report::{QuantumReport, RunReport};

/// The scheduler's own instance of the append-only-records idea used
/// throughout this crate: push once per terminal transition, read back only
/// after the run is over.
#[derive(Debug, Default)]
pub struct ReportAggregator {
    reports: Mutex<Vec<QuantumReport>>,
}

impl ReportAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: QuantumReport) {
        self.reports.lock().push(report);
    }

    /// Consumes the aggregator, returning the assembled `RunReport`. Entries
    /// keep the order the scheduler observed completions in, which is not
    /// required to match topological order.
    pub fn finish(self) -> RunReport {
        let mut run = RunReport::new();
        for report in self.reports.into_inner() {
            run.push(report);
        }
        run
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgraph_core::state::NodeState;

    #[test]
    fn records_in_observation_order() {
        let agg = ReportAggregator::new();
        agg.record(QuantumReport::succeeded(1, "b", "ok"));
        agg.record(QuantumReport::succeeded(0, "a", "ok"));
        let report = agg.finish();
        let labels: Vec<_> = report.quanta().iter().map(|q| q.label.as_str()).collect();
        assert_eq!(labels, vec!["b", "a"]);
        assert!(report.quanta().iter().all(|q| q.state == NodeState::Succeeded));
    }
}
