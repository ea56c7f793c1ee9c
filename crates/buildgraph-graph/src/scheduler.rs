//! Generic scheduler for directed acyclic graphs.
//!
//! Every node sits in exactly one of three sets: unscheduled, scheduled
//! (dispatched but not finished) or complete. Finishing a node drops it from
//! every remaining node's dependency set, so the leaf frontier advances as
//! work completes.
//!
//! Usage:
//!
//! ```ignore
//! let mut scheduler = Scheduler::new(&dependency_map);
//! while !scheduler.is_complete() {
//!     for item in scheduler.schedulable()? {
//!         scheduler.schedule(item)?;
//!         // ... run the work for the item ...
//!         scheduler.finish(item)?;
//!     }
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use buildgraph_core::{BuildGraphError, Result};

pub struct Scheduler<N: Copy + Eq + Hash + Debug> {
    dependency_map: HashMap<N, HashSet<N>>,
    dependent_map: HashMap<N, HashSet<N>>,
    remaining: HashSet<N>,
    unscheduled: HashSet<N>,
    scheduled: HashSet<N>,
    complete: HashSet<N>,
}

impl<N: Copy + Eq + Hash + Debug> Scheduler<N> {
    /// Schedule the whole graph in dependency order.
    ///
    /// `dependency_map` maps each node to the set of nodes it depends on.
    pub fn new(dependency_map: &HashMap<N, HashSet<N>>) -> Self {
        Self::build(dependency_map, None, false)
    }

    /// Schedule with optional target pruning and direction reversal.
    ///
    /// With targets, only the targets and their transitive dependencies take
    /// part; everything else is ignored even if present in the map. With
    /// `reverse`, edges are inverted so dependents come before dependencies
    /// (the cache pre-run order).
    pub fn build(
        dependency_map: &HashMap<N, HashSet<N>>,
        targets: Option<&HashSet<N>>,
        reverse: bool,
    ) -> Self {
        let mut nodes: HashSet<N> = dependency_map.keys().copied().collect();
        for dependencies in dependency_map.values() {
            nodes.extend(dependencies.iter().copied());
        }

        let keep = match targets {
            Some(targets) => {
                let mut keep = HashSet::new();
                let mut stack: Vec<N> = targets.iter().copied().collect();
                while let Some(node) = stack.pop() {
                    if !keep.insert(node) {
                        continue;
                    }
                    if let Some(dependencies) = dependency_map.get(&node) {
                        stack.extend(dependencies.iter().copied());
                    }
                }
                keep
            }
            None => nodes,
        };

        let mut forward: HashMap<N, HashSet<N>> = HashMap::new();
        for node in &keep {
            if let Some(dependencies) = dependency_map.get(node) {
                let kept: HashSet<N> = dependencies
                    .iter()
                    .copied()
                    .filter(|dependency| keep.contains(dependency))
                    .collect();
                if !kept.is_empty() {
                    forward.insert(*node, kept);
                }
            }
        }

        let dependency_map = if reverse { invert(&forward) } else { forward.clone() };
        let dependent_map = invert(&dependency_map);

        Self {
            dependency_map,
            dependent_map,
            remaining: keep.clone(),
            unscheduled: keep,
            scheduled: HashSet::new(),
            complete: HashSet::new(),
        }
    }

    /// Nodes with no remaining dependencies. Dependencies are dropped as
    /// nodes finish, so this frontier moves as the scheduler runs.
    pub fn leaves(&self) -> HashSet<N> {
        self.remaining
            .iter()
            .copied()
            .filter(|node| !self.dependency_map.contains_key(node))
            .collect()
    }

    /// Leaves that have not been scheduled yet. Raises a cyclic-graph error
    /// when nothing is schedulable, nothing is in flight, and work remains.
    pub fn schedulable(&self) -> Result<Vec<N>> {
        let leaves = self.leaves();
        if leaves.is_empty() && self.scheduled.is_empty() && !self.remaining.is_empty() {
            return Err(BuildGraphError::Graph(format!(
                "cyclic dependency graph: {:?}",
                self.dependency_map
            )));
        }
        Ok(leaves
            .into_iter()
            .filter(|node| !self.scheduled.contains(node))
            .collect())
    }

    /// Non-leaf nodes still waiting on something else.
    pub fn blocked(&self) -> HashSet<N> {
        let leaves = self.leaves();
        self.unscheduled
            .iter()
            .copied()
            .filter(|node| !leaves.contains(node))
            .collect()
    }

    pub fn unscheduled(&self) -> &HashSet<N> {
        &self.unscheduled
    }

    pub fn scheduled(&self) -> &HashSet<N> {
        &self.scheduled
    }

    pub fn complete(&self) -> &HashSet<N> {
        &self.complete
    }

    /// Nodes that have not finished yet.
    pub fn incomplete(&self) -> HashSet<N> {
        self.unscheduled.union(&self.scheduled).copied().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.unscheduled.is_empty() && self.scheduled.is_empty()
    }

    /// Move a node from unscheduled to scheduled. The node must come from
    /// `schedulable`: still unscheduled and with no remaining dependencies.
    pub fn schedule(&mut self, node: N) -> Result<()> {
        if self.dependency_map.contains_key(&node) {
            return Err(BuildGraphError::Graph(format!(
                "node {node:?} still has unfinished dependencies"
            )));
        }
        if !self.unscheduled.remove(&node) {
            return Err(BuildGraphError::Graph(format!(
                "node {node:?} is not awaiting scheduling"
            )));
        }
        self.scheduled.insert(node);
        Ok(())
    }

    /// Mark a scheduled node complete, unblocking its dependents. Must be
    /// called exactly once per node.
    pub fn finish(&mut self, node: N) -> Result<()> {
        if !self.scheduled.remove(&node) {
            return Err(BuildGraphError::Graph(format!(
                "node {node:?} was finished without being scheduled"
            )));
        }
        if let Some(dependents) = self.dependent_map.get(&node) {
            for dependent in dependents {
                if let Some(dependencies) = self.dependency_map.get_mut(dependent) {
                    dependencies.remove(&node);
                    if dependencies.is_empty() {
                        self.dependency_map.remove(dependent);
                    }
                }
            }
        }
        self.remaining.remove(&node);
        self.complete.insert(node);
        Ok(())
    }
}

fn invert<N: Copy + Eq + Hash>(map: &HashMap<N, HashSet<N>>) -> HashMap<N, HashSet<N>> {
    let mut inverted: HashMap<N, HashSet<N>> = HashMap::new();
    for (node, others) in map {
        for other in others {
            inverted.entry(*other).or_default().insert(*node);
        }
    }
    inverted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(
        pairs: &[(&'static str, &[&'static str])],
    ) -> HashMap<&'static str, HashSet<&'static str>> {
        pairs
            .iter()
            .map(|(node, dependencies)| (*node, dependencies.iter().copied().collect()))
            .collect()
    }

    fn drain(scheduler: &mut Scheduler<&'static str>) -> Vec<HashSet<&'static str>> {
        let mut waves = Vec::new();
        while !scheduler.is_complete() {
            let batch = scheduler.schedulable().unwrap();
            waves.push(batch.iter().copied().collect());
            for item in batch {
                scheduler.schedule(item).unwrap();
                scheduler.finish(item).unwrap();
            }
        }
        waves
    }

    #[test]
    fn basic_chain_runs_in_order() {
        // y depends on x, z depends on y.
        let map = deps(&[("y", &["x"]), ("z", &["y"])]);
        let mut scheduler = Scheduler::new(&map);

        assert_eq!(scheduler.blocked(), HashSet::from(["y", "z"]));
        let waves = drain(&mut scheduler);
        assert_eq!(
            waves,
            vec![
                HashSet::from(["x"]),
                HashSet::from(["y"]),
                HashSet::from(["z"]),
            ]
        );
        assert_eq!(scheduler.complete().len(), 3);
    }

    #[test]
    fn cycles_are_detected() {
        let map = deps(&[("x", &["y"]), ("y", &["z"]), ("z", &["x"])]);
        let scheduler = Scheduler::new(&map);
        assert!(matches!(
            scheduler.schedulable(),
            Err(BuildGraphError::Graph(_))
        ));
    }

    #[test]
    fn complex_tree_schedules_in_waves() {
        let map = deps(&[
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["b"]),
            ("e", &["c"]),
            ("f", &["d", "e", "g"]),
        ]);
        let mut scheduler = Scheduler::new(&map);
        let waves = drain(&mut scheduler);
        assert_eq!(
            waves,
            vec![
                HashSet::from(["a", "g"]),
                HashSet::from(["b"]),
                HashSet::from(["c", "d"]),
                HashSet::from(["e"]),
                HashSet::from(["f"]),
            ]
        );
    }

    #[test]
    fn targets_prune_unreachable_nodes() {
        // b and c depend on a; d on b; e on c. With target d, c and e must
        // never be touched.
        let map = deps(&[("b", &["a"]), ("c", &["a"]), ("d", &["b"]), ("e", &["c"])]);
        let targets = HashSet::from(["d"]);
        let mut scheduler = Scheduler::build(&map, Some(&targets), false);
        let waves = drain(&mut scheduler);
        assert_eq!(
            waves,
            vec![
                HashSet::from(["a"]),
                HashSet::from(["b"]),
                HashSet::from(["d"]),
            ]
        );
        assert!(!scheduler.complete().contains("c"));
        assert!(!scheduler.complete().contains("e"));
    }

    #[test]
    fn reverse_mode_visits_dependents_first() {
        let map = deps(&[("y", &["x"]), ("z", &["y"])]);
        let mut scheduler = Scheduler::build(&map, None, true);
        let waves = drain(&mut scheduler);
        assert_eq!(
            waves,
            vec![
                HashSet::from(["z"]),
                HashSet::from(["y"]),
                HashSet::from(["x"]),
            ]
        );
    }

    #[test]
    fn misuse_is_rejected() {
        let map = deps(&[("y", &["x"])]);
        let mut scheduler = Scheduler::new(&map);
        // y is blocked, so scheduling it is an error.
        assert!(scheduler.schedule("y").is_err());
        assert!(scheduler.finish("x").is_err());
        scheduler.schedule("x").unwrap();
        // Double-scheduling is an error.
        assert!(scheduler.schedule("x").is_err());
        scheduler.finish("x").unwrap();
        assert!(scheduler.finish("x").is_err());
    }
}
