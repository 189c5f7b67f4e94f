//! DAG compilation: cycle detection and topological layering.

use goclaw_core::{GoclawError, Result, TaskSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Dependency graph over task IDs.
///
/// Insertion rejects duplicate IDs and edges referencing unknown nodes;
/// `compile` rejects cycles with the concrete cycle path.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: BTreeSet<String>,
    /// dependency -> dependents
    successors: BTreeMap<String, BTreeSet<String>>,
    /// dependent -> dependencies
    predecessors: BTreeMap<String, BTreeSet<String>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from task specs, wiring their declared dependencies.
    pub fn from_specs(specs: &[TaskSpec]) -> Result<Self> {
        let mut graph = Self::new();
        for spec in specs {
            graph.add_node(&spec.id)?;
        }
        for spec in specs {
            for dep in &spec.dependencies {
                graph.add_edge(dep, &spec.id)?;
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, id: &str) -> Result<()> {
        if !self.nodes.insert(id.to_string()) {
            return Err(GoclawError::DuplicateTask(id.to_string()));
        }
        Ok(())
    }

    /// Add a dependency edge: `to` runs only after `from`.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        for (node, other) in [(from, to), (to, from)] {
            if !self.nodes.contains(node) {
                return Err(GoclawError::DependencyNotFound {
                    task_id: other.to_string(),
                    dependency_id: node.to_string(),
                });
            }
        }
        self.successors
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.predecessors
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Three-color DFS. Returns the concrete cycle path (first node repeated
    /// at the end) when the graph is cyclic.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            self.nodes.iter().map(|n| (n.as_str(), Color::White)).collect();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            successors: &'a BTreeMap<String, BTreeSet<String>>,
            colors: &mut HashMap<&'a str, Color>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            colors.insert(node, Color::Gray);
            stack.push(node);
            if let Some(nexts) = successors.get(node) {
                for next in nexts {
                    match colors[next.as_str()] {
                        Color::Gray => {
                            // The cycle is the stack suffix from the gray hit.
                            let start = stack.iter().position(|n| *n == next.as_str()).unwrap();
                            let mut path: Vec<String> =
                                stack[start..].iter().map(|s| s.to_string()).collect();
                            path.push(next.clone());
                            return Some(path);
                        }
                        Color::White => {
                            if let Some(path) = visit(next, successors, colors, stack) {
                                return Some(path);
                            }
                        }
                        Color::Black => {}
                    }
                }
            }
            stack.pop();
            colors.insert(node, Color::Black);
            None
        }

        for node in &self.nodes {
            if colors[node.as_str()] == Color::White {
                if let Some(path) = visit(node, &self.successors, &mut colors, &mut stack) {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Layered Kahn compile: layer k holds every node whose dependencies all
    /// sit in layers < k. Ties within a layer order by ascending task ID.
    pub fn compile(&self) -> Result<ExecutionPlan> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| {
                let deg = self.predecessors.get(n).map_or(0, |p| p.len());
                (n.as_str(), deg)
            })
            .collect();

        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut processed = 0usize;

        while !current.is_empty() {
            // BTreeMap iteration already yields ascending IDs.
            processed += current.len();
            let mut next: Vec<&str> = Vec::new();
            for node in &current {
                if let Some(succs) = self.successors.get(*node) {
                    for succ in succs {
                        let deg = in_degree.get_mut(succ.as_str()).unwrap();
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(succ.as_str());
                        }
                    }
                }
            }
            next.sort_unstable();
            layers.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }

        if processed != self.nodes.len() {
            let path = self.detect_cycle().unwrap_or_default();
            return Err(GoclawError::CyclicDependency { path });
        }

        Ok(ExecutionPlan::new(layers))
    }
}

/// Compiled execution plan: ordered layers of concurrently runnable tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub layers: Vec<Vec<String>>,
    pub total_tasks: usize,
    /// Size of the widest layer
    pub max_parallelism: usize,
    /// Number of layers, a lower bound on the critical path
    pub critical_path_len: usize,
}

impl ExecutionPlan {
    fn new(layers: Vec<Vec<String>>) -> Self {
        let total_tasks = layers.iter().map(|l| l.len()).sum();
        let max_parallelism = layers.iter().map(|l| l.len()).max().unwrap_or(0);
        let critical_path_len = layers.len();
        Self {
            layers,
            total_tasks,
            max_parallelism,
            critical_path_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_tasks == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)], nodes: &[&str]) -> TaskGraph {
        let mut g = TaskGraph::new();
        for n in nodes {
            g.add_node(n).unwrap();
        }
        for (from, to) in edges {
            g.add_edge(from, to).unwrap();
        }
        g
    }

    #[test]
    fn test_empty_graph_compiles_to_empty_plan() {
        let plan = TaskGraph::new().compile().unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.layers.len(), 0);
        assert_eq!(plan.max_parallelism, 0);
    }

    #[test]
    fn test_single_node_plan() {
        let plan = graph(&[], &["a"]).compile().unwrap();
        assert_eq!(plan.layers, vec![vec!["a".to_string()]]);
        assert_eq!(plan.total_tasks, 1);
        assert_eq!(plan.max_parallelism, 1);
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut g = TaskGraph::new();
        g.add_node("a").unwrap();
        let err = g.add_node("a").unwrap_err();
        assert!(matches!(err, GoclawError::DuplicateTask(id) if id == "a"));
    }

    #[test]
    fn test_edge_to_unknown_node_rejected() {
        let mut g = TaskGraph::new();
        g.add_node("a").unwrap();
        let err = g.add_edge("a", "ghost").unwrap_err();
        assert!(matches!(err, GoclawError::DependencyNotFound { .. }));
    }

    #[test]
    fn test_diamond_compiles_to_three_layers() {
        let plan = graph(
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
            &["a", "b", "c", "d"],
        )
        .compile()
        .unwrap();
        assert_eq!(
            plan.layers,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(plan.max_parallelism, 2);
        assert_eq!(plan.critical_path_len, 3);
    }

    #[test]
    fn test_layer_tie_order_is_ascending_id() {
        let plan = graph(&[], &["zeta", "alpha", "mid"]).compile().unwrap();
        assert_eq!(
            plan.layers[0],
            vec!["alpha".to_string(), "mid".to_string(), "zeta".to_string()]
        );
    }

    #[test]
    fn test_cycle_returns_concrete_path() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a")], &["a", "b", "c"]);
        let path = g.detect_cycle().unwrap();
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);

        let err = g.compile().unwrap_err();
        match err {
            GoclawError::CyclicDependency { path } => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected CyclicDependency, got {other}"),
        }
    }

    #[test]
    fn test_self_loop_detected() {
        let mut g = TaskGraph::new();
        g.add_node("a").unwrap();
        g.add_edge("a", "a").unwrap();
        assert_eq!(g.detect_cycle().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn test_every_dependency_in_strictly_earlier_layer() {
        let plan = graph(
            &[("a", "c"), ("b", "c"), ("c", "d"), ("b", "d"), ("a", "e")],
            &["a", "b", "c", "d", "e"],
        )
        .compile()
        .unwrap();

        let layer_of: std::collections::HashMap<&str, usize> = plan
            .layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| layer.iter().map(move |t| (t.as_str(), i)))
            .collect();
        // Union of layers equals all tasks, each exactly once.
        assert_eq!(layer_of.len(), 5);
        for (dep, task) in [("a", "c"), ("b", "c"), ("c", "d"), ("b", "d"), ("a", "e")] {
            assert!(layer_of[dep] < layer_of[task], "{dep} must precede {task}");
        }
    }

    #[test]
    fn test_from_specs_wires_dependencies() {
        let specs = vec![
            TaskSpec::new("a", "A"),
            TaskSpec::new("b", "B").with_dependencies(vec!["a".to_string()]),
        ];
        let plan = TaskGraph::from_specs(&specs).unwrap().compile().unwrap();
        assert_eq!(plan.layers.len(), 2);

        let specs = vec![TaskSpec::new("b", "B").with_dependencies(vec!["ghost".to_string()])];
        assert!(TaskGraph::from_specs(&specs).is_err());
    }
}
