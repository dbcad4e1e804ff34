//! The graph view: topological iteration, dependency lookup, cycle detection.

use crate::error::GraphError;
use crate::quantum::QuantumNode;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;
use std::fmt;

/// Read-only contract the scheduler drives: topological iteration, dependency
/// lookup, and cycle detection. [`Graph`] is the canonical implementation;
/// kept as a trait so a fixup can hand back anything that satisfies it.
pub trait GraphView: fmt::Debug {
    /// Number of nodes in the graph.
    fn size(&self) -> usize;

    /// All node indices, in an unspecified but stable order.
    fn indices(&self) -> Vec<usize>;

    /// The node at `index`, if present.
    fn node(&self, index: usize) -> Option<&QuantumNode>;

    /// The predecessor indices of `index` (empty if `index` is absent).
    fn dependencies_of(&self, index: usize) -> &[usize];

    /// A topological ordering of every node index. Order within a level is
    /// unspecified but stable for a given graph instance.
    fn topological_order(&self) -> Vec<usize>;

    /// The indices making up a cycle, or empty if the graph is acyclic.
    fn find_cycle(&self) -> Vec<usize>;
}

/// The canonical, petgraph-backed [`GraphView`] implementation.
///
/// Edges run dependency -> dependent (predecessor -> successor), matching the
/// direction a fixup adds its synthetic ordering edges in.
#[derive(Clone)]
pub struct Graph {
    inner: DiGraph<QuantumNode, ()>,
    index_of: HashMap<usize, NodeIndex>,
    // Empty dependency lists returned by reference need somewhere to live.
    dep_cache: HashMap<usize, Vec<usize>>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.inner.node_count())
            .field("edges", &self.inner.edge_count())
            .finish()
    }
}

impl Graph {
    /// Build a graph from a flat node list. Every `dependencies` entry must
    /// name an `index` present in `nodes`, or this fails with
    /// [`GraphError::UnknownDependency`]. Does not itself check acyclicity;
    /// call [`GraphView::find_cycle`] to check.
    pub fn new(nodes: Vec<QuantumNode>) -> Result<Self, GraphError> {
        let mut inner = DiGraph::new();
        let mut index_of = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let idx = node.index;
            let ni = inner.add_node(node);
            if index_of.insert(idx, ni).is_some() {
                return Err(GraphError::DuplicateIndex(idx));
            }
        }

        for ni in inner.node_indices() {
            let deps = inner[ni].dependencies.clone();
            for dep in deps {
                let dep_ni = *index_of
                    .get(&dep)
                    .ok_or(GraphError::UnknownDependency { node: inner[ni].index, dependency: dep })?;
                inner.add_edge(dep_ni, ni, ());
            }
        }

        let mut graph = Self { inner, index_of, dep_cache: HashMap::new() };
        graph.rebuild_dep_cache();
        Ok(graph)
    }

    fn rebuild_dep_cache(&mut self) {
        self.dep_cache.clear();
        for ni in self.inner.node_indices() {
            let index = self.inner[ni].index;
            let deps = self.inner[ni].dependencies.iter().copied().collect();
            self.dep_cache.insert(index, deps);
        }
    }

    /// Add a synthetic dependency edge `from -> to` (i.e. `to` now depends on
    /// `from`), as a fixup does. Updates both the edge set and the
    /// dependent's recorded `dependencies`. Does not check acyclicity; the
    /// scheduler re-checks via `find_cycle` after the fixup runs.
    pub fn add_dependency_edge(&mut self, from: usize, to: usize) -> Result<(), GraphError> {
        let from_ni = *self
            .index_of
            .get(&from)
            .ok_or(GraphError::UnknownDependency { node: to, dependency: from })?;
        let to_ni = *self
            .index_of
            .get(&to)
            .ok_or(GraphError::UnknownDependency { node: to, dependency: from })?;
        self.inner.add_edge(from_ni, to_ni, ());
        self.inner[to_ni].dependencies.insert(from);
        self.rebuild_dep_cache();
        Ok(())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &QuantumNode> {
        self.inner.node_weights()
    }
}

impl GraphView for Graph {
    fn size(&self) -> usize {
        self.inner.node_count()
    }

    fn indices(&self) -> Vec<usize> {
        self.inner.node_weights().map(|n| n.index).collect()
    }

    fn node(&self, index: usize) -> Option<&QuantumNode> {
        self.index_of.get(&index).map(|ni| &self.inner[*ni])
    }

    fn dependencies_of(&self, index: usize) -> &[usize] {
        self.dep_cache.get(&index).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn topological_order(&self) -> Vec<usize> {
        match petgraph::algo::toposort(&self.inner, None) {
            Ok(order) => order.into_iter().map(|ni| self.inner[ni].index).collect(),
            // Cycle: no well-defined topological order. The scheduler always
            // checks `find_cycle` before relying on this, so fall back to
            // insertion order rather than panicking.
            Err(_) => self.indices(),
        }
    }

    fn find_cycle(&self) -> Vec<usize> {
        let sccs = tarjan_scc(&self.inner);
        sccs.into_iter()
            .find(|component| component.len() > 1)
            .map(|component| component.into_iter().map(|ni| self.inner[ni].index).collect())
            .unwrap_or_default()
    }
}

/// Successor indices of `index` within `graph` (the reverse of `dependencies_of`).
pub fn successors_of(graph: &Graph, index: usize) -> Vec<usize> {
    match graph.index_of.get(&index) {
        Some(ni) => graph
            .inner
            .edges_directed(*ni, Direction::Outgoing)
            .map(|edge| graph.inner[edge.target()].index)
            .collect(),
        None => Vec::new(),
    }
}

/// Successor indices of `index`, for any [`GraphView`] (not just the
/// concrete [`Graph`]). Scans every node's recorded dependencies, since the
/// trait only exposes the predecessor direction.
pub fn successors_of_view(view: &dyn GraphView, index: usize) -> Vec<usize> {
    view.indices()
        .into_iter()
        .filter(|&candidate| view.dependencies_of(candidate).contains(&index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantum::{QuantumPayload, TaskDef};
    use std::sync::Arc;

    fn node(index: usize, deps: &[usize]) -> QuantumNode {
        QuantumNode::new(
            index,
            Arc::new(TaskDef::placeholder("t")),
            QuantumPayload::default(),
            deps.iter().copied(),
        )
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let graph = Graph::new(vec![node(0, &[]), node(1, &[0]), node(2, &[1])]).unwrap();
        assert!(graph.find_cycle().is_empty());
        assert_eq!(graph.topological_order(), vec![0, 1, 2]);
    }

    #[test]
    fn detects_cycle() {
        let mut graph = Graph::new(vec![node(0, &[]), node(1, &[0]), node(2, &[1])]).unwrap();
        graph.add_dependency_edge(2, 0).unwrap();
        let mut cycle = graph.find_cycle();
        cycle.sort();
        assert_eq!(cycle, vec![0, 1, 2]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = Graph::new(vec![node(0, &[42])]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn successors_reverse_dependencies() {
        let graph = Graph::new(vec![node(0, &[]), node(1, &[0]), node(2, &[0])]).unwrap();
        let mut succ = successors_of(&graph, 0);
        succ.sort();
        assert_eq!(succ, vec![1, 2]);
    }
}
