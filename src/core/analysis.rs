//! Static analysis of a dependency graph: levels, critical path and the
//! speedup parallel execution could reach.

use serde::{Deserialize, Serialize};

use crate::core::dag::{CriticalPath, DependencyGraph};
use crate::core::task::TaskId;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub task_count: usize,
    pub topological_order: Vec<TaskId>,
    pub levels: Vec<Vec<TaskId>>,
    pub critical_path: CriticalPath,
    /// Sum of every task's cost: the cost of running one at a time.
    pub sequential_cost: f64,
    /// Sum over levels of the most expensive task in each level.
    pub parallel_cost: f64,
    pub speedup: f64,
}

impl GraphAnalysis {
    pub fn of(graph: &DependencyGraph) -> Result<Self> {
        let levels = graph.compute_levels()?;
        let critical_path = graph.critical_path()?;

        let cost = |id: &TaskId| graph.get(id).map_or(0.0, |t| t.estimated_cost);
        let sequential_cost: f64 = graph.tasks().iter().map(|t| t.estimated_cost).sum();
        let parallel_cost: f64 = levels
            .iter()
            .map(|level| level.iter().map(cost).fold(0.0, f64::max))
            .sum();
        let speedup = if parallel_cost > 0.0 {
            sequential_cost / parallel_cost
        } else {
            1.0
        };

        Ok(Self {
            task_count: graph.len(),
            topological_order: levels.iter().flatten().cloned().collect(),
            levels,
            critical_path,
            sequential_cost,
            parallel_cost,
            speedup,
        })
    }
}
