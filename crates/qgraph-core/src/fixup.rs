//! Pre-execution graph transforms the scheduler applies exactly once, before
//! computing the initial ready set.

use crate::graph::{Graph, GraphView};
use thiserror::Error;

/// Errors raised applying an [`ExecutionGraphFixup`].
#[derive(Debug, Error)]
pub enum FixupError {
    /// A node matched by the fixup's label is missing the data-id field it
    /// needs to order by. Mirrors a `KeyError` on the missing field.
    #[error("node {index} (label {label:?}) has no data-id field {field:?}")]
    MissingField { index: usize, label: String, field: String },
    #[error(transparent)]
    Graph(#[from] crate::error::GraphError),
}

/// Caller-supplied transform applied once before scheduling begins: `apply`
/// takes the graph view the scheduler would otherwise use directly and
/// returns a new one with extra ordering edges. Must preserve acyclicity;
/// the scheduler re-checks for cycles after applying it and treats a
/// violation as a startup failure, not a fixup error.
pub trait ExecutionGraphFixup: Send + Sync {
    fn apply(&self, graph: &dyn GraphView) -> Result<Graph, FixupError>;
}

/// The canonical fixup: nodes sharing `label` are ordered by the integer
/// value of `dataid_field` in their quantum (ascending, or descending when
/// `reverse`), then chained with a dependency edge from each to the next.
/// Ties break on node index.
pub struct OrderByDataIdField {
    pub label: String,
    pub dataid_field: String,
    pub reverse: bool,
}

impl OrderByDataIdField {
    pub fn new(label: impl Into<String>, dataid_field: impl Into<String>, reverse: bool) -> Self {
        Self { label: label.into(), dataid_field: dataid_field.into(), reverse }
    }

    fn field_value(&self, graph: &dyn GraphView, index: usize) -> Result<i64, FixupError> {
        let node = graph.node(index).expect("index came from graph.indices()");
        node.quantum
            .get(&self.dataid_field)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| FixupError::MissingField {
                index,
                label: node.task_def.label.clone(),
                field: self.dataid_field.clone(),
            })
    }
}

impl ExecutionGraphFixup for OrderByDataIdField {
    fn apply(&self, graph: &dyn GraphView) -> Result<Graph, FixupError> {
        let matching: Vec<usize> = graph
            .indices()
            .into_iter()
            .filter(|&index| {
                graph
                    .node(index)
                    .map(|n| n.task_def.label == self.label)
                    .unwrap_or(false)
            })
            .collect();

        debug!("ordering {} node(s) labelled {:?} by {:?} (reverse={})", matching.len(), self.label, self.dataid_field, self.reverse);
        let mut keyed = matching
            .into_iter()
            .map(|index| Ok((self.field_value(graph, index)?, index)))
            .collect::<Result<Vec<_>, FixupError>>()?;

        keyed.sort_by(|(a_val, a_idx), (b_val, b_idx)| {
            let by_value = if self.reverse { b_val.cmp(a_val) } else { a_val.cmp(b_val) };
            by_value.then_with(|| a_idx.cmp(b_idx))
        });

        let nodes: Vec<_> = graph.indices().into_iter().filter_map(|i| graph.node(i).cloned()).collect();
        let mut built = Graph::new(nodes)?;

        for pair in keyed.windows(2) {
            let (_, from) = pair[0];
            let (_, to) = pair[1];
            built.add_dependency_edge(from, to)?;
        }
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantum::{QuantumPayload, QuantumNode, TaskDef};
    use serde_json::json;
    use std::sync::Arc;

    fn node(index: usize, label: &str, detector: i64) -> QuantumNode {
        QuantumNode::new(
            index,
            Arc::new(TaskDef::new(label, "demo::Task")),
            QuantumPayload(json!({ "detector": detector })),
            [],
        )
    }

    #[test]
    fn orders_ascending() {
        let graph = Graph::new(vec![node(0, "task1", 2), node(1, "task1", 0), node(2, "task1", 1)]).unwrap();
        let fixup = OrderByDataIdField::new("task1", "detector", false);
        let fixed = fixup.apply(&graph).unwrap();
        assert_eq!(fixed.topological_order(), vec![1, 2, 0]);
    }

    #[test]
    fn orders_descending_when_reversed() {
        let graph = Graph::new(vec![node(0, "task1", 0), node(1, "task1", 1), node(2, "task1", 2)]).unwrap();
        let fixup = OrderByDataIdField::new("task1", "detector", true);
        let fixed = fixup.apply(&graph).unwrap();
        assert_eq!(fixed.topological_order(), vec![2, 1, 0]);
    }

    #[test]
    fn missing_field_fails_loudly() {
        let graph = Graph::new(vec![QuantumNode::new(
            0,
            Arc::new(TaskDef::new("task1", "demo::Task")),
            QuantumPayload(json!({})),
            [],
        )])
        .unwrap();
        let fixup = OrderByDataIdField::new("task1", "detector", false);
        assert!(matches!(fixup.apply(&graph), Err(FixupError::MissingField { .. })));
    }

    #[test]
    fn applying_twice_is_a_no_op_on_edges() {
        let graph = Graph::new(vec![node(0, "task1", 0), node(1, "task1", 1)]).unwrap();
        let fixup = OrderByDataIdField::new("task1", "detector", false);
        let once = fixup.apply(&graph).unwrap();
        let twice = fixup.apply(&once).unwrap();
        assert_eq!(once.topological_order(), twice.topological_order());
        assert_eq!(once.dependencies_of(1), twice.dependencies_of(1));
    }
}
