//! Per-subject dependency graph
//!
//! Nodes are analysis names. An edge `dependent -> dependency` records that
//! `dependent` needs `dependency`'s results. The graph is rebuilt from the
//! ledger whenever it is needed and is never persisted.

use std::collections::HashMap;

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::GraphError;

/// Directed acyclic graph over analysis names
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    inner: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; adding an existing name is a no-op
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        let idx = self.inner.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Record that `dependent` needs `dependency`.
    ///
    /// The edge is rolled back if it would close a cycle.
    ///
    /// # Errors
    /// [`GraphError::SelfLoop`] or [`GraphError::CycleDetected`]
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) -> Result<(), GraphError> {
        if dependent == dependency {
            return Err(GraphError::SelfLoop(dependent.to_string()));
        }
        let from = self.add_node(dependent);
        let to = self.add_node(dependency);
        if self.inner.contains_edge(from, to) {
            return Ok(());
        }
        let edge = self.inner.add_edge(from, to, ());
        if is_cyclic_directed(&self.inner) {
            self.inner.remove_edge(edge);
            return Err(GraphError::CycleDetected {
                from: dependent.to_string(),
                to: dependency.to_string(),
            });
        }
        Ok(())
    }

    /// Whether a node exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    /// Number of edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Node names in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.inner.node_indices().map(|idx| self.inner[idx].as_str())
    }

    fn neighbours(&self, name: &str, direction: Direction) -> Result<Vec<&str>, GraphError> {
        let idx = self
            .index
            .get(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))?;
        let mut names: Vec<&str> = self
            .inner
            .neighbors_directed(*idx, direction)
            .map(|n| self.inner[n].as_str())
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    /// What `name` needs
    ///
    /// # Errors
    /// [`GraphError::NodeNotFound`] for unknown names
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        self.neighbours(name, Direction::Outgoing)
    }

    /// What needs `name`
    ///
    /// # Errors
    /// [`GraphError::NodeNotFound`] for unknown names
    pub fn dependents(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        self.neighbours(name, Direction::Incoming)
    }

    /// Unfinished nodes whose dependencies are all finished, in insertion order.
    ///
    /// These are the analyses that may be built and submitted now.
    #[must_use]
    pub fn latest<F>(&self, is_finished: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        self.inner
            .node_indices()
            .filter(|idx| !is_finished(&self.inner[*idx]))
            .filter(|idx| {
                self.inner
                    .neighbors_directed(*idx, Direction::Outgoing)
                    .all(|dep| is_finished(&self.inner[dep]))
            })
            .map(|idx| self.inner[idx].clone())
            .collect()
    }

    /// Every node, dependencies before dependents
    ///
    /// # Errors
    /// Unreachable while edges are only added through [`Self::add_dependency`]
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        match toposort(&self.inner, None) {
            Ok(order) => Ok(order
                .into_iter()
                .rev()
                .map(|idx| self.inner[idx].clone())
                .collect()),
            Err(cycle) => {
                let name = self.inner[cycle.node_id()].clone();
                Err(GraphError::CycleDetected {
                    from: name.clone(),
                    to: name,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_simple_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("A1", "A0").unwrap();
        graph.add_dependency("A2", "A1").unwrap();

        let err = graph.add_dependency("A0", "A2").unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
        assert_eq!(graph.edge_count(), 2, "rejected edge must be rolled back");
    }

    #[test]
    fn test_rejects_self_loop() {
        let mut graph = DependencyGraph::new();
        assert_eq!(
            graph.add_dependency("A0", "A0"),
            Err(GraphError::SelfLoop("A0".to_string()))
        );
    }

    #[test]
    fn test_latest_frontier() {
        let mut graph = DependencyGraph::new();
        graph.add_node("A0");
        graph.add_node("B0");
        graph.add_dependency("A1", "A0").unwrap();
        graph.add_dependency("A2", "A1").unwrap();

        assert_eq!(graph.latest(|_| false), vec!["A0", "B0"]);
        assert_eq!(graph.latest(|n| n == "A0"), vec!["B0", "A1"]);
        assert_eq!(graph.latest(|_| true), Vec::<String>::new());
    }

    #[test]
    fn test_topological_order_puts_dependencies_first() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("combine", "A1").unwrap();
        graph.add_dependency("combine", "A0").unwrap();
        graph.add_dependency("A1", "A0").unwrap();

        let order = graph.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("A0") < pos("A1"));
        assert!(pos("A1") < pos("combine"));
    }

    #[test]
    fn test_neighbours() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("A1", "A0").unwrap();
        assert_eq!(graph.dependencies("A1").unwrap(), vec!["A0"]);
        assert_eq!(graph.dependents("A0").unwrap(), vec!["A1"]);
        assert!(graph.dependencies("missing").is_err());
    }
}
