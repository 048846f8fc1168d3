//! Dependency graph for submitted tasks.
//!
//! Tasks are nodes in a petgraph `DiGraph`; an edge `a -> b` means `b`
//! depends on `a` and cannot start until `a` is COMPLETE. The graph is
//! immutable once a run starts, so every query here is a pure function of
//! its structure.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction::{Incoming, Outgoing};
use serde::{Deserialize, Serialize};

use crate::core::task::{TaskId, TaskSpec};
use crate::error::{Error, Result};

/// Longest cost-weighted chain through the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    pub tasks: Vec<TaskId>,
    pub total_cost: f64,
}

impl CriticalPath {
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// The task dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<TaskSpec, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a whole submission.
    ///
    /// All tasks are inserted before any edge, so dependencies may refer to
    /// tasks listed later. The result is validated: unknown dependency ids,
    /// duplicate ids and cycles are all rejected here.
    pub fn from_tasks<I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = TaskSpec>,
    {
        let tasks: Vec<TaskSpec> = tasks.into_iter().collect();
        let mut dag = Self::new();
        for task in &tasks {
            task.validate()?;
            dag.insert_node(task.clone())?;
        }
        for task in &tasks {
            for dep in &task.deps {
                dag.link(dep, &task.id)?;
            }
        }
        dag.validate()?;
        Ok(dag)
    }

    /// Add a task whose dependencies are already in the graph.
    ///
    /// Unknown dependency ids are rejected immediately, before the task is
    /// inserted.
    pub fn add(&mut self, task: TaskSpec) -> Result<NodeIndex> {
        task.validate()?;
        if self.contains(&task.id) {
            return Err(Error::DuplicateTask(task.id.to_string()));
        }
        if let Some(missing) = task.deps.iter().find(|dep| !self.contains(dep)) {
            return Err(Error::UnknownDependency {
                task: task.id.to_string(),
                dependency: missing.to_string(),
            });
        }
        let id = task.id.clone();
        let deps = task.deps.clone();
        let index = self.insert_node(task)?;
        for dep in &deps {
            self.link(dep, &id)?;
        }
        Ok(index)
    }

    /// Record that `to` depends on `from`.
    ///
    /// No cycle check happens here; call [`validate`](Self::validate) once
    /// the graph is assembled.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let to_index = self
            .node(to)
            .ok_or_else(|| Error::TaskNotFound(to.to_string()))?;
        self.link(from, to)?;
        let spec = &mut self.graph[to_index];
        if !spec.deps.contains(from) {
            spec.deps.push(from.clone());
        }
        Ok(())
    }

    fn insert_node(&mut self, task: TaskSpec) -> Result<NodeIndex> {
        if self.contains(&task.id) {
            return Err(Error::DuplicateTask(task.id.to_string()));
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    fn link(&mut self, dep: &TaskId, task: &TaskId) -> Result<()> {
        let from = self.node(dep).ok_or_else(|| Error::UnknownDependency {
            task: task.to_string(),
            dependency: dep.to_string(),
        })?;
        let to = self
            .node(task)
            .ok_or_else(|| Error::TaskNotFound(task.to_string()))?;
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    fn node(&self, id: &TaskId) -> Option<NodeIndex> {
        self.task_index.get(id).copied()
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.node(id).map(|index| &self.graph[index])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All tasks, sorted by id.
    pub fn tasks(&self) -> Vec<&TaskSpec> {
        let mut tasks: Vec<&TaskSpec> = self.graph.node_weights().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskSpec> {
        self.neighbors(id, Incoming)
    }

    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskSpec> {
        self.neighbors(id, Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: petgraph::Direction) -> Vec<&TaskSpec> {
        let Some(index) = self.node(id) else {
            return Vec::new();
        };
        let mut out: Vec<&TaskSpec> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| &self.graph[n])
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Every task that directly or indirectly depends on `id`, sorted.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(start) = self.node(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut ids: Vec<TaskId> = seen.into_iter().map(|n| self.graph[n].id.clone()).collect();
        ids.sort();
        ids
    }

    /// Tasks not in `completed` whose dependencies are all in `completed`.
    pub fn ready(&self, completed: &HashSet<TaskId>) -> Vec<&TaskSpec> {
        let mut ready: Vec<&TaskSpec> = self
            .graph
            .node_indices()
            .filter(|&index| !completed.contains(&self.graph[index].id))
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Incoming)
                    .all(|dep| completed.contains(&self.graph[dep].id))
            })
            .map(|index| &self.graph[index])
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    /// Reject the graph if it contains a cycle, naming the members.
    pub fn validate(&self) -> Result<()> {
        match self.find_cycle() {
            Some(members) => Err(Error::CyclicDependency {
                members: members.into_iter().map(|id| id.0).collect(),
            }),
            None => Ok(()),
        }
    }

    /// Depth-first search with an explicit recursion stack.
    ///
    /// Returns the tasks on the first cycle found, in dependency order,
    /// starting from the task the search re-entered. Traversal order is by
    /// task id so the answer is deterministic.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks: HashMap<NodeIndex, Mark> = self
            .graph
            .node_indices()
            .map(|n| (n, Mark::Unvisited))
            .collect();

        for root in self.sorted_nodes() {
            if marks[&root] != Mark::Unvisited {
                continue;
            }
            marks.insert(root, Mark::OnStack);
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(root, self.successors(root))];

            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                match frame.1.pop() {
                    Some(next) => match marks[&next] {
                        Mark::OnStack => {
                            let start = stack.iter().position(|(n, _)| *n == next)?;
                            return Some(
                                stack[start..]
                                    .iter()
                                    .map(|(n, _)| self.graph[*n].id.clone())
                                    .collect(),
                            );
                        }
                        Mark::Unvisited => {
                            marks.insert(next, Mark::OnStack);
                            stack.push((next, self.successors(next)));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        let (done, _) = stack.pop()?;
                        marks.insert(done, Mark::Done);
                    }
                }
            }
        }
        None
    }

    fn sorted_nodes(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        nodes.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
        nodes
    }

    // Reverse-sorted so popping yields ascending id order.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self.graph.neighbors_directed(node, Outgoing).collect();
        next.sort_by(|a, b| self.graph[*b].id.cmp(&self.graph[*a].id));
        next
    }

    fn cycle_error(&self) -> Error {
        Error::CyclicDependency {
            members: self
                .find_cycle()
                .unwrap_or_default()
                .into_iter()
                .map(|id| id.0)
                .collect(),
        }
    }

    /// Group tasks into levels: a task's level is one more than the highest
    /// level among its dependencies, roots are level 0. Every task in a level
    /// can run in parallel once the previous levels are done.
    pub fn compute_levels(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut waiting: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Incoming).count()))
            .collect();
        let mut current: Vec<NodeIndex> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0;
        while !current.is_empty() {
            current.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
            let mut next = Vec::new();
            for &node in &current {
                for dependent in self.graph.neighbors_directed(node, Outgoing) {
                    if let Some(count) = waiting.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            placed += current.len();
            levels.push(current.iter().map(|n| self.graph[*n].id.clone()).collect());
            current = next;
        }

        if placed < self.graph.node_count() {
            return Err(self.cycle_error());
        }
        Ok(levels)
    }

    /// Tasks in level order; ties inside a level are broken by id.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        Ok(self.compute_levels()?.into_iter().flatten().collect())
    }

    /// Longest path by summed `estimated_cost`.
    ///
    /// Earliest start times are computed in topological order; the path ends
    /// at the task that finishes last and is traced back through whichever
    /// dependency finishes latest. Ties go to the smaller id.
    pub fn critical_path(&self) -> Result<CriticalPath> {
        let order = toposort(&self.graph, None).map_err(|_| self.cycle_error())?;

        let mut finish: HashMap<NodeIndex, f64> = HashMap::with_capacity(order.len());
        for &node in &order {
            let start = self
                .graph
                .neighbors_directed(node, Incoming)
                .filter_map(|dep| finish.get(&dep).copied())
                .fold(0.0, f64::max);
            finish.insert(node, start + self.graph[node].estimated_cost);
        }

        let Some(mut current) = self.latest_finishing(order.iter().copied(), &finish) else {
            return Ok(CriticalPath::default());
        };
        let total_cost = finish[&current];
        let mut path = vec![current];
        while let Some(dep) =
            self.latest_finishing(self.graph.neighbors_directed(current, Incoming), &finish)
        {
            path.push(dep);
            current = dep;
        }
        path.reverse();

        Ok(CriticalPath {
            tasks: path.into_iter().map(|n| self.graph[n].id.clone()).collect(),
            total_cost,
        })
    }

    fn latest_finishing(
        &self,
        nodes: impl Iterator<Item = NodeIndex>,
        finish: &HashMap<NodeIndex, f64>,
    ) -> Option<NodeIndex> {
        nodes.max_by(|a, b| {
            finish[a]
                .partial_cmp(&finish[b])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.graph[*b].id.cmp(&self.graph[*a].id))
        })
    }
}
