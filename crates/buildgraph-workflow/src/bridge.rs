//! The config/workflow bridge: how an embedding application describes its
//! tree of configurations and the transforms they yield.

use std::collections::{HashMap, HashSet};

use buildgraph_core::{Context, Result, Transform};
use buildgraph_graph::{Graph, TransformId};

/// A node in the configuration tree. The engine walks this surface to build
/// the transform graph; everything else about configuration (parsing,
/// layout, validation) belongs to the embedding application.
pub trait ConfigNode {
    /// Child configurations, in order.
    fn iter_config(&self) -> Vec<&dyn ConfigNode> {
        Vec::new()
    }

    /// The transforms this configuration yields.
    fn iter_transforms(&self, _ctx: &Context) -> Result<Vec<Transform>> {
        Ok(Vec::new())
    }

    /// Whether a child configuration's target selection passes through
    /// untouched. When false (the default), this node's `transform_filter`
    /// re-filters the child's targets.
    fn config_filter(&self, _child: &dyn ConfigNode) -> bool {
        false
    }

    /// Whether a transform is a target of this configuration.
    fn transform_filter(&self, _transform: &Transform, _config: &dyn ConfigNode) -> bool {
        true
    }
}

struct GatherEntry {
    transforms: Vec<Transform>,
    target_indices: Vec<usize>,
}

/// Walk the configuration tree (children first), collecting each config's
/// transforms and its filtered target selection. Each node is processed
/// exactly once.
fn gather(config: &dyn ConfigNode, ctx: &Context) -> Result<Vec<GatherEntry>> {
    let mut entries = Vec::new();
    for child in config.iter_config() {
        for entry in gather(child, ctx)? {
            let GatherEntry {
                transforms,
                mut target_indices,
            } = entry;
            if !config.config_filter(child) {
                target_indices
                    .retain(|&index| config.transform_filter(&transforms[index], child));
            }
            entries.push(GatherEntry {
                transforms,
                target_indices,
            });
        }
    }
    let transforms = config.iter_transforms(ctx)?;
    let target_indices = transforms
        .iter()
        .enumerate()
        .filter(|(_, transform)| config.transform_filter(transform, config))
        .map(|(index, _)| index)
        .collect();
    entries.push(GatherEntry {
        transforms,
        target_indices,
    });
    Ok(entries)
}

/// A fully-built workflow plan: the graph, the target set, and the
/// dependency maps derived through medials.
pub struct Plan {
    pub graph: Graph,
    pub targets: HashSet<TransformId>,
    pub dependency_map: HashMap<TransformId, HashSet<TransformId>>,
    pub dependent_map: HashMap<TransformId, HashSet<TransformId>>,
}

/// Gather the configuration tree into a graph and validate it.
pub fn build_plan(root: &dyn ConfigNode, ctx: &Context) -> Result<Plan> {
    let mut graph = Graph::new();
    let mut targets = HashSet::new();
    for entry in gather(root, ctx)? {
        let mut ids = Vec::with_capacity(entry.transforms.len());
        for transform in entry.transforms {
            ids.push(graph.add(transform)?);
        }
        for index in entry.target_indices {
            targets.insert(ids[index]);
        }
    }
    graph.validate()?;
    let dependency_map = graph.dependency_map();
    let dependent_map = graph.dependent_map();
    Ok(Plan {
        graph,
        targets,
        dependency_map,
        dependent_map,
    })
}
