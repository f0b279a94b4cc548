//! Task dependency graph for a single room.
//!
//! `TaskGraph` is built from a snapshot of a room's tasks and dependency
//! edges for the duration of one operation. Nodes are tasks; an edge
//! `from -> to` means `to` requires `from` to be done.

use std::collections::HashMap;

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::task::{Task, TaskDependency, TaskId};
use crate::error::{Error, Result};

pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    /// Edges whose endpoints are not known tasks. A missing from-task
    /// can never be done, so it keeps its to-task from being ready.
    dangling: Vec<TaskDependency>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            dangling: Vec::new(),
        }
    }

    /// Build a graph from a room snapshot.
    pub fn from_parts(tasks: Vec<Task>, edges: &[TaskDependency]) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task);
        }
        for edge in edges {
            match (graph.task_index.get(&edge.from), graph.task_index.get(&edge.to)) {
                (Some(&from), Some(&to)) => {
                    graph.graph.update_edge(from, to, ());
                }
                _ => graph.dangling.push(*edge),
            }
        }
        graph
    }

    /// Add a task. Returns the existing index when the id is already present.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }
        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Tasks that `id` depends on (from-tasks of its incoming edges).
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// A task is ready when every from-task of its dependencies is done.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        if self.dangling.iter().any(|edge| edge.to == *id) {
            return false;
        }
        self.dependencies_of(id).iter().all(|dep| dep.is_done())
    }

    /// Dependencies of `id` that are not done yet.
    pub fn pending_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.dependencies_of(id)
            .into_iter()
            .filter(|dep| !dep.is_done())
            .collect()
    }

    /// Whether adding `from -> to` would close a cycle.
    ///
    /// A self edge counts as a cycle.
    pub fn would_create_cycle(&self, from: &TaskId, to: &TaskId) -> bool {
        if from == to {
            return true;
        }
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&from_idx), Some(&to_idx)) => {
                has_path_connecting(&self.graph, to_idx, from_idx, None)
            }
            _ => false,
        }
    }

    /// Tasks in an order where each task comes after its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let title = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.title.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", title))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
