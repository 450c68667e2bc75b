//! Service dependency graph
//!
//! Nodes keep registration order. Every walk starts from the nodes in that
//! order and follows dependencies in their listed order, so the computed
//! initialization order is the same on every run.

use std::collections::{HashMap, HashSet};

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

use super::error::ContainerError;

/// One registered service and the services it depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    pub name: String,
    pub deps: Vec<String>,
}

/// Adjacency list of registered services, in registration order
///
/// Serializes as a JSON object `{ name: [deps] }` preserving that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: Vec<ServiceNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node; callers guarantee unique names
    pub fn push(&mut self, name: impl Into<String>, deps: Vec<String>) {
        self.nodes.push(ServiceNode {
            name: name.into(),
            deps,
        });
    }

    pub fn nodes(&self) -> &[ServiceNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Declared dependencies of `name`
    pub fn dependencies(&self, name: &str) -> Option<&[String]> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.deps.as_slice())
    }

    /// Services that list `name` as a dependency, in registration order
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.deps.iter().any(|d| d == name))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Check that every dependency is registered and there are no cycles
    pub fn validate(&self) -> Result<(), ContainerError> {
        debug!(node_count = self.nodes.len(), "validate: called");
        let index = self.index();

        for node in &self.nodes {
            if let Some(missing) = node.deps.iter().find(|d| !index.contains_key(d.as_str())) {
                debug!(service = %node.name, %missing, "validate: unknown dependency");
                return Err(ContainerError::unknown(missing.clone(), Some(node.name.as_str())));
            }
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut cycle_path = Vec::new();
        for idx in 0..self.nodes.len() {
            if !visited.contains(&idx) && self.has_cycle_dfs(idx, &index, &mut visited, &mut rec_stack, &mut cycle_path)
            {
                debug!(?cycle_path, "validate: cycle detected");
                return Err(ContainerError::CircularDependency {
                    path: trim_to_cycle(cycle_path),
                });
            }
        }

        debug!("validate: graph is acyclic");
        Ok(())
    }

    /// Validate only the services `root` reaches, walking from `root`
    pub fn validate_from(&self, root: &str) -> Result<(), ContainerError> {
        debug!(%root, "validate_from: called");
        let index = self.index();
        let Some(&start) = index.get(root) else {
            return Err(ContainerError::unknown(root, None));
        };

        let mut reachable = HashSet::new();
        let mut reached = Vec::new();
        self.topo_dfs_idx(start, &index, &mut reachable, &mut reached);
        for idx in reached.into_iter().rev() {
            let node = &self.nodes[idx];
            if let Some(missing) = node.deps.iter().find(|d| !index.contains_key(d.as_str())) {
                debug!(service = %node.name, %missing, "validate_from: unknown dependency");
                return Err(ContainerError::unknown(missing.clone(), Some(node.name.as_str())));
            }
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut cycle_path = Vec::new();
        if self.has_cycle_dfs(start, &index, &mut visited, &mut rec_stack, &mut cycle_path) {
            debug!(?cycle_path, "validate_from: cycle detected");
            return Err(ContainerError::CircularDependency {
                path: trim_to_cycle(cycle_path),
            });
        }
        Ok(())
    }

    /// Service names with every dependency before its dependents
    pub fn topological_order(&self) -> Result<Vec<String>, ContainerError> {
        debug!(node_count = self.nodes.len(), "topological_order: called");
        self.validate()?;

        let index = self.index();
        let mut visited = HashSet::new();
        let mut result = Vec::with_capacity(self.nodes.len());
        for idx in 0..self.nodes.len() {
            self.topo_dfs_idx(idx, &index, &mut visited, &mut result);
        }

        debug!(?result, "topological_order: complete");
        Ok(result.into_iter().map(|idx| self.nodes[idx].name.clone()).collect())
    }

    fn index(&self) -> HashMap<&str, usize> {
        self.nodes.iter().enumerate().map(|(i, n)| (n.name.as_str(), i)).collect()
    }

    /// DFS helper for cycle detection; leaves the DFS path in `cycle_path`
    fn has_cycle_dfs(
        &self,
        idx: usize,
        index: &HashMap<&str, usize>,
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
        cycle_path: &mut Vec<String>,
    ) -> bool {
        let node = &self.nodes[idx];
        visited.insert(idx);
        rec_stack.insert(idx);
        cycle_path.push(node.name.clone());

        for dep in &node.deps {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                continue;
            };
            if !visited.contains(&dep_idx) {
                if self.has_cycle_dfs(dep_idx, index, visited, rec_stack, cycle_path) {
                    return true;
                }
            } else if rec_stack.contains(&dep_idx) {
                debug!(service = %node.name, %dep, "has_cycle_dfs: back edge found");
                cycle_path.push(dep.clone());
                return true;
            }
        }

        rec_stack.remove(&idx);
        cycle_path.pop();
        false
    }

    /// DFS post-order helper for the topological sort
    fn topo_dfs_idx(
        &self,
        idx: usize,
        index: &HashMap<&str, usize>,
        visited: &mut HashSet<usize>,
        result: &mut Vec<usize>,
    ) {
        if !visited.insert(idx) {
            return;
        }
        for dep in &self.nodes[idx].deps {
            if let Some(&dep_idx) = index.get(dep.as_str()) {
                self.topo_dfs_idx(dep_idx, index, visited, result);
            }
        }
        result.push(idx);
    }
}

/// Drop the DFS prefix leading into the cycle: `[X, A, B, A]` becomes `[A, B, A]`
fn trim_to_cycle(mut path: Vec<String>) -> Vec<String> {
    let start = path.last().and_then(|last| path.iter().position(|n| n == last));
    if let Some(start) = start {
        path.drain(..start);
    }
    path
}

impl Serialize for DependencyGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.nodes.len()))?;
        for node in &self.nodes {
            map.serialize_entry(&node.name, &node.deps)?;
        }
        map.end()
    }
}

impl FromIterator<(String, Vec<String>)> for DependencyGraph {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().map(|(name, deps)| ServiceNode { name, deps }).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        edges
            .iter()
            .map(|(name, deps)| (name.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_topological_order_dependencies_first() {
        let g = graph(&[
            ("mapManager", &["eventBus", "stateManager"]),
            ("stateManager", &["eventBus"]),
            ("eventBus", &[]),
        ]);
        assert_eq!(g.topological_order().unwrap(), vec!["eventBus", "stateManager", "mapManager"]);
    }

    #[test]
    fn test_topological_order_ties_follow_registration() {
        let g = graph(&[("c", &[]), ("a", &[]), ("b", &["a"])]);
        assert_eq!(g.topological_order().unwrap(), vec!["c", "a", "b"]);
        // Deterministic across calls
        assert_eq!(g.topological_order().unwrap(), g.topological_order().unwrap());
    }

    #[test]
    fn test_two_node_cycle() {
        let g = graph(&[("A", &["B"]), ("B", &["A"])]);
        match g.topological_order().unwrap_err() {
            ContainerError::CircularDependency { path } => assert_eq!(path, vec!["A", "B", "A"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_path_excludes_entry_prefix() {
        let g = graph(&[("root", &["A"]), ("A", &["B"]), ("B", &["C"]), ("C", &["A"])]);
        match g.validate().unwrap_err() {
            ContainerError::CircularDependency { path } => assert_eq!(path, vec!["A", "B", "C", "A"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("loop", &["loop"])]);
        assert!(matches!(g.validate(), Err(ContainerError::CircularDependency { .. })));
    }

    #[test]
    fn test_unknown_dependency_names_both() {
        let g = graph(&[("legend", &["colorScale"])]);
        let err = g.topological_order().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("colorScale"));
        assert!(msg.contains("legend"));
    }

    #[test]
    fn test_validate_from_ignores_unreachable_problems() {
        let g = graph(&[
            ("eventBus", &[]),
            ("mapManager", &["eventBus"]),
            ("A", &["B"]),
            ("B", &["A"]),
            ("legend", &["colorScale"]),
        ]);
        assert!(g.validate_from("mapManager").is_ok());
        match g.validate_from("B").unwrap_err() {
            ContainerError::CircularDependency { path } => assert_eq!(path, vec!["B", "A", "B"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(g.validate_from("legend").unwrap_err().to_string().contains("colorScale"));
        assert!(matches!(g.validate_from("nope"), Err(ContainerError::UnknownService { .. })));
    }

    #[test]
    fn test_dependents_and_dependencies() {
        let g = graph(&[("eventBus", &[]), ("a", &["eventBus"]), ("b", &["eventBus", "a"])]);
        assert_eq!(g.dependents("eventBus"), vec!["a", "b"]);
        assert_eq!(g.dependencies("b").unwrap(), ["eventBus", "a"]);
        assert!(g.dependencies("missing").is_none());
    }

    #[test]
    fn test_serializes_in_registration_order() {
        let g = graph(&[("z", &[]), ("a", &["z"])]);
        let json = serde_json::to_string(&g).unwrap();
        assert_eq!(json, r#"{"z":[],"a":["z"]}"#);
    }
}
