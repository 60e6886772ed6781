//! Dependency graph - in-memory adjacency view of the edge table
//!
//! Built on demand from the store, so it always reflects the transaction
//! it was loaded in. Traversal follows edge insertion order.

use super::error::Result;
use super::model::{Dependency, Task, TaskId, TaskStatus};
use super::store::Txn;
use std::collections::{HashMap, HashSet};

/// Adjacency list: task -> tasks it depends on
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes in order of first appearance in the edge list
    order: Vec<TaskId>,
    edges: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyGraph {
    pub fn from_edges(edges: &[Dependency]) -> Self {
        let mut graph = Self::default();
        let mut seen = HashSet::new();
        for edge in edges {
            for node in [edge.task_id, edge.depends_on] {
                if seen.insert(node) {
                    graph.order.push(node);
                }
            }
            graph
                .edges
                .entry(edge.task_id)
                .or_default()
                .push(edge.depends_on);
        }
        graph
    }

    /// Load every edge visible to `txn`
    pub fn load(txn: &Txn<'_>) -> Result<Self> {
        Ok(Self::from_edges(&txn.edges()?))
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn dependencies(&self, task_id: TaskId) -> &[TaskId] {
        self.edges.get(&task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_edge(&self, task_id: TaskId, depends_on: TaskId) -> bool {
        self.dependencies(task_id).contains(&depends_on)
    }

    /// Check if a task can start (all dependencies completed)
    pub fn can_start(&self, task_id: TaskId, statuses: &HashMap<TaskId, TaskStatus>) -> bool {
        self.dependencies(task_id)
            .iter()
            .all(|dep| statuses.get(dep) == Some(&TaskStatus::Completed))
    }

    /// Pending tasks whose dependencies are all completed, in the given order
    pub fn ready_tasks(&self, tasks: &[Task]) -> Vec<TaskId> {
        let statuses: HashMap<TaskId, TaskStatus> =
            tasks.iter().map(|t| (t.id, t.status)).collect();
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && self.can_start(t.id, &statuses))
            .map(|t| t.id)
            .collect()
    }

    /// Every cycle reachable by depth-first search.
    ///
    /// Each unvisited node starts a search; whenever an edge points back at
    /// a node on the current path, the path slice from that node plus the
    /// closing node is recorded (`[a, b, a]`). Uses an explicit stack so
    /// arbitrarily deep chains cannot overflow.
    pub fn find_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<TaskId> = HashSet::new();

        for &root in &self.order {
            if visited.contains(&root) {
                continue;
            }

            let mut path: Vec<TaskId> = vec![root];
            let mut on_path: HashSet<TaskId> = HashSet::from([root]);
            // (node, index of the next neighbor to explore)
            let mut stack: Vec<(TaskId, usize)> = vec![(root, 0)];
            visited.insert(root);

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let next = self.dependencies(node).get(frame.1).copied();
                frame.1 += 1;

                match next {
                    Some(neighbor) if on_path.contains(&neighbor) => {
                        let start = path
                            .iter()
                            .position(|&n| n == neighbor)
                            .unwrap_or_default();
                        let mut cycle = path[start..].to_vec();
                        cycle.push(neighbor);
                        cycles.push(cycle);
                    }
                    Some(neighbor) if !visited.contains(&neighbor) => {
                        visited.insert(neighbor);
                        on_path.insert(neighbor);
                        path.push(neighbor);
                        stack.push((neighbor, 0));
                    }
                    Some(_) => {}
                    None => {
                        stack.pop();
                        path.pop();
                        on_path.remove(&node);
                    }
                }
            }
        }

        cycles
    }

    /// True when every consecutive pair in `cycle` is an edge and it ends where it starts
    pub fn is_closed_walk(&self, cycle: &[TaskId]) -> bool {
        cycle.len() >= 2
            && cycle.first() == cycle.last()
            && cycle.windows(2).all(|w| self.has_edge(w[0], w[1]))
    }
}
