//! Dependency graph shared by task dependencies and workflow steps.
//!
//! Nodes are keys (task ids, step ids); an edge `a -> b` means `a` must
//! finish before `b` may start. Edges that would close a cycle are
//! rejected, so the graph is a DAG at all times.

use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

/// A directed acyclic graph over keys of type `K`.
///
/// Uses petgraph's `StableDiGraph` so node indices survive removals
/// (tasks are evicted from the middle of the graph).
pub struct DependencyGraph<K> {
    graph: StableDiGraph<K, ()>,
    index: HashMap<K, NodeIndex>,
}

impl<K> DependencyGraph<K>
where
    K: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a node. Adding an existing key returns its existing index.
    pub fn add_node(&mut self, key: K) -> NodeIndex {
        if let Some(&index) = self.index.get(&key) {
            return index;
        }
        let index = self.graph.add_node(key.clone());
        self.index.insert(key, index);
        index
    }

    /// Remove a node and all of its edges.
    pub fn remove_node(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(index) => {
                self.graph.remove_node(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Record that `prerequisite` must finish before `dependent`.
    ///
    /// # Errors
    /// - `Validation` if either key is not in the graph
    /// - `Cycle` if the edge would make the graph cyclic (including self-loops)
    pub fn add_dependency(&mut self, prerequisite: &K, dependent: &K) -> Result<()> {
        let from = self.node(prerequisite)?;
        let to = self.node(dependent)?;

        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }

        // from -> to closes a cycle iff `to` already reaches `from`
        if has_path_connecting(&self.graph, to, from, None) {
            return Err(Error::Cycle(format!(
                "{} depending on {} would create a cycle",
                dependent, prerequisite
            )));
        }

        self.graph.add_edge(from, to, ());
        Ok(())
    }

    /// Replace every prerequisite of `dependent` atomically.
    ///
    /// If any new edge is rejected, the previous edge set is restored.
    pub fn set_prerequisites(&mut self, dependent: &K, prerequisites: &[K]) -> Result<()> {
        let to = self.node(dependent)?;
        let previous = self.prerequisites(dependent);

        let incoming: Vec<_> = self
            .graph
            .edges_directed(to, Direction::Incoming)
            .map(|edge| edge.id())
            .collect();
        for edge in incoming {
            self.graph.remove_edge(edge);
        }

        for prerequisite in prerequisites {
            if let Err(err) = self.add_dependency(prerequisite, dependent) {
                self.set_prerequisites(dependent, &previous)?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Keys that must finish before `key` (incoming edges).
    pub fn prerequisites(&self, key: &K) -> Vec<K> {
        self.neighbors(key, Direction::Incoming)
    }

    /// Keys waiting on `key` (outgoing edges).
    pub fn dependents(&self, key: &K) -> Vec<K> {
        self.neighbors(key, Direction::Outgoing)
    }

    pub fn has_dependency(&self, prerequisite: &K, dependent: &K) -> bool {
        match (self.index.get(prerequisite), self.index.get(dependent)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Keys in an order where every key follows its prerequisites.
    pub fn topological_order(&self) -> Result<Vec<K>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Cycle(format!("cycle detected at {}", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index).cloned())
            .collect())
    }

    /// Partition the graph into levels.
    ///
    /// Level 0 holds every key without prerequisites; level n holds every
    /// key whose prerequisites all sit in levels < n. Within a level, keys
    /// keep insertion order.
    pub fn levels(&self) -> Result<Vec<Vec<K>>> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                let degree = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count();
                (index, degree)
            })
            .collect();

        let mut order: Vec<NodeIndex> = self.graph.node_indices().collect();
        order.sort();

        let mut levels = Vec::new();
        let mut placed = 0;
        while placed < order.len() {
            let level: Vec<NodeIndex> = order
                .iter()
                .copied()
                .filter(|index| remaining.get(index) == Some(&0))
                .collect();
            if level.is_empty() {
                return Err(Error::Cycle(
                    "graph contains a cycle; remaining nodes never become ready".to_string(),
                ));
            }
            for index in &level {
                remaining.remove(index);
                for next in self.graph.neighbors_directed(*index, Direction::Outgoing) {
                    if let Some(degree) = remaining.get_mut(&next) {
                        *degree -= 1;
                    }
                }
            }
            placed += level.len();
            levels.push(
                level
                    .into_iter()
                    .filter_map(|index| self.graph.node_weight(index).cloned())
                    .collect(),
            );
        }
        Ok(levels)
    }

    fn node(&self, key: &K) -> Result<NodeIndex> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| Error::Validation(format!("{} not found in graph", key)))
    }

    fn neighbors(&self, key: &K, direction: Direction) -> Vec<K> {
        match self.index.get(key) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n).cloned())
                .collect(),
            None => Vec::new(),
        }
    }
}

impl<K> Default for DependencyGraph<K>
where
    K: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for DependencyGraph<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
