//! Property tests over generated graphs.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use conductor::core::{DependencyGraph, TaskId, TaskSpec, TaskState};

use crate::fixtures::{completed, started, Harness};

// Acyclic by construction: task N may only depend on tasks 0..N-1.
fn graph_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<TaskSpec>> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), num_tasks),
            proptest::collection::vec(1u32..=6, num_tasks),
        )
            .prop_map(move |(raw_deps, costs)| {
                raw_deps
                    .into_iter()
                    .zip(costs)
                    .enumerate()
                    .map(|(i, (potential, cost))| {
                        let deps: HashSet<String> = potential
                            .into_iter()
                            .filter(|_| i > 0)
                            .map(|d| format!("task_{}", d % i))
                            .collect();
                        TaskSpec::new(format!("task_{i}"), "true")
                            .with_deps(deps)
                            .with_cost(f64::from(cost) * 0.5)
                    })
                    .collect()
            })
    })
}

proptest! {
    #[test]
    fn test_levels_respect_dependencies(tasks in graph_strategy(12)) {
        let graph = DependencyGraph::from_tasks(tasks.clone()).unwrap();
        let levels = graph.compute_levels().unwrap();

        let mut level_of: HashMap<TaskId, usize> = HashMap::new();
        for (n, level) in levels.iter().enumerate() {
            prop_assert!(!level.is_empty());
            for id in level {
                prop_assert!(level_of.insert(id.clone(), n).is_none(), "{} placed twice", id);
            }
        }
        prop_assert_eq!(level_of.len(), tasks.len());

        for task in &tasks {
            let n = level_of[&task.id];
            prop_assert_eq!(n == 0, task.deps.is_empty());
            for dep in &task.deps {
                prop_assert!(level_of[dep] < n, "{} is not below {}", dep, task.id);
            }
        }
    }

    #[test]
    fn test_critical_path_is_a_heaviest_chain(tasks in graph_strategy(12)) {
        let graph = DependencyGraph::from_tasks(tasks.clone()).unwrap();
        let path = graph.critical_path().unwrap();
        let cost: HashMap<&TaskId, f64> = tasks.iter().map(|t| (&t.id, t.estimated_cost)).collect();

        prop_assert!(!path.is_empty());
        for pair in path.tasks.windows(2) {
            let next = graph.get(&pair[1]).unwrap();
            prop_assert!(next.deps.contains(&pair[0]), "{} -> {} is not an edge", pair[0], pair[1]);
        }
        let total: f64 = path.tasks.iter().map(|id| cost[id]).sum();
        prop_assert!((total - path.total_cost).abs() < 1e-9);

        let sequential: f64 = tasks.iter().map(|t| t.estimated_cost).sum();
        prop_assert!(path.total_cost <= sequential + 1e-9);
        for task in &tasks {
            prop_assert!(path.total_cost + 1e-9 >= task.estimated_cost);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn test_run_honours_cap_and_ordering(
        tasks in graph_strategy(7),
        cap in 1usize..=3,
        failing in proptest::collection::vec(0usize..7, 0..2),
    ) {
        let failing: HashSet<String> = failing.into_iter().map(|i| format!("task_{i}")).collect();
        let tasks: Vec<TaskSpec> = tasks
            .into_iter()
            .map(|mut t| {
                if failing.contains(t.id.as_str()) {
                    t.command = "exit 1".to_string();
                }
                t
            })
            .collect();
        let graph = DependencyGraph::from_tasks(tasks.clone()).unwrap();

        let harness = Harness::new(cap);
        let (report, _) = tokio_test::block_on(harness.run(graph));

        prop_assert!(report.peak_concurrency <= cap);
        prop_assert!(report.tasks.iter().all(|r| r.state.is_terminal()));

        for task in &tasks {
            let record = report.task(task.id.as_str()).unwrap();
            let deps_complete = task
                .deps
                .iter()
                .all(|d| report.task(d.as_str()).unwrap().state == TaskState::Complete);
            if !deps_complete {
                prop_assert_eq!(record.state, TaskState::Cancelled);
                prop_assert!(record.started_at.is_none());
                continue;
            }
            let expected = if failing.contains(task.id.as_str()) {
                TaskState::Failed
            } else {
                TaskState::Complete
            };
            prop_assert_eq!(record.state, expected);
            for dep in &task.deps {
                let dep = report.task(dep.as_str()).unwrap();
                prop_assert!(started(record) >= completed(dep));
            }
        }
    }
}
