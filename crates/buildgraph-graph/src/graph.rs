//! The transform arena and medial table.
//!
//! Transforms are stored in an arena and addressed by integer handle;
//! medials hold handles rather than owning references, so producer/consumer
//! back-references never form ownership cycles. Dependency edges are derived
//! entirely from medials: a consumer depends on the producer of every medial
//! it reads.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use buildgraph_core::{BuildGraphError, Result, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformId(u32);

impl TransformId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MedialId(u32);

impl MedialId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A value flowing between transforms: at most one producer, any number of
/// consumers.
#[derive(Debug)]
pub struct Medial {
    pub val: String,
    pub producers: Vec<TransformId>,
    pub consumers: Vec<TransformId>,
}

impl Medial {
    /// Whether the medial exists on disk ahead of any transform running.
    /// Dangling symlinks count: they are hashable.
    pub fn exists(&self) -> bool {
        let path = Path::new(&self.val);
        path.exists()
            || std::fs::symlink_metadata(path)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false)
    }
}

/// Arena of transforms plus the interned medial table.
#[derive(Default)]
pub struct Graph {
    transforms: Vec<Transform>,
    medials: Vec<Medial>,
    index: HashMap<String, MedialId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transform, binding it as producer or consumer of every medial
    /// its interfaces reference. A medial with a second producer is a graph
    /// error.
    pub fn add(&mut self, transform: Transform) -> Result<TransformId> {
        let tid = TransformId(self.transforms.len() as u32);
        for entry in transform.ifaces() {
            for val in &entry.spec.medials {
                let mid = self.intern(val);
                let medial = &mut self.medials[mid.index()];
                if entry.direction.is_output() {
                    if let Some(existing) = medial.producers.first() {
                        return Err(BuildGraphError::Graph(format!(
                            "medial `{val}` produced by more than one transform \
                             (`{}` and `{}`)",
                            self.transforms[existing.index()].label(),
                            transform.label()
                        )));
                    }
                    medial.producers.push(tid);
                } else {
                    medial.consumers.push(tid);
                }
            }
        }
        self.transforms.push(transform);
        Ok(tid)
    }

    fn intern(&mut self, val: &str) -> MedialId {
        if let Some(mid) = self.index.get(val) {
            return *mid;
        }
        let mid = MedialId(self.medials.len() as u32);
        self.medials.push(Medial {
            val: val.to_string(),
            producers: Vec::new(),
            consumers: Vec::new(),
        });
        self.index.insert(val.to_string(), mid);
        mid
    }

    pub fn transform(&self, tid: TransformId) -> &Transform {
        &self.transforms[tid.index()]
    }

    pub fn transforms(&self) -> impl Iterator<Item = (TransformId, &Transform)> {
        self.transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| (TransformId(index as u32), transform))
    }

    pub fn medial(&self, mid: MedialId) -> &Medial {
        &self.medials[mid.index()]
    }

    pub fn medials(&self) -> impl Iterator<Item = (MedialId, &Medial)> {
        self.medials
            .iter()
            .enumerate()
            .map(|(index, medial)| (MedialId(index as u32), medial))
    }

    pub fn medial_id(&self, val: &str) -> Option<MedialId> {
        self.index.get(val).copied()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Map from each transform to the transforms it depends on.
    pub fn dependency_map(&self) -> HashMap<TransformId, HashSet<TransformId>> {
        let mut map: HashMap<TransformId, HashSet<TransformId>> = self
            .transforms()
            .map(|(tid, _)| (tid, HashSet::new()))
            .collect();
        for medial in &self.medials {
            for producer in &medial.producers {
                for consumer in &medial.consumers {
                    if consumer != producer {
                        map.get_mut(consumer)
                            .expect("all transforms have entries")
                            .insert(*producer);
                    }
                }
            }
        }
        map
    }

    /// Map from each transform to the transforms that depend on it.
    pub fn dependent_map(&self) -> HashMap<TransformId, HashSet<TransformId>> {
        let mut map: HashMap<TransformId, HashSet<TransformId>> = self
            .transforms()
            .map(|(tid, _)| (tid, HashSet::new()))
            .collect();
        for (consumer, dependencies) in self.dependency_map() {
            for producer in dependencies {
                map.get_mut(&producer)
                    .expect("all transforms have entries")
                    .insert(consumer);
            }
        }
        map
    }

    /// Check that every consumed medial is either produced by some transform
    /// or already present on disk.
    pub fn validate(&self) -> Result<()> {
        for medial in &self.medials {
            if medial.producers.is_empty() && !medial.consumers.is_empty() && !medial.exists() {
                let consumer = self.transforms[medial.consumers[0].index()].label();
                return Err(BuildGraphError::Graph(format!(
                    "dangling medial `{}`: consumed by `{consumer}` but never \
                     produced and not present on disk",
                    medial.val
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use buildgraph_core::{
        Context, FieldDef, FieldType, Transform, TransformDef, Value,
    };

    fn def(fields: Vec<FieldDef>) -> TransformDef {
        TransformDef::new("demo", "T", fields, vec![], Arc::new(|_| Ok(Vec::new()))).unwrap()
    }

    fn path_value(path: &Path) -> Value {
        Value::path_spec(Some(path.to_path_buf()), None, false).unwrap()
    }

    #[test]
    fn medials_link_producers_to_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new("demo", dir.path());
        let shared = dir.path().join("scratch/shared.bin");

        let producer_def = def(vec![FieldDef::output("out", FieldType::Path)]);
        let consumer_def = def(vec![FieldDef::input("inp", FieldType::Path)]);

        let mut graph = Graph::new();
        let producer = graph
            .add(
                Transform::new(
                    &producer_def,
                    &ctx,
                    "u",
                    "p",
                    BTreeMap::from([("out".to_string(), path_value(&shared))]),
                )
                .unwrap(),
            )
            .unwrap();
        let consumer = graph
            .add(
                Transform::new(
                    &consumer_def,
                    &ctx,
                    "u",
                    "c",
                    BTreeMap::from([("inp".to_string(), path_value(&shared))]),
                )
                .unwrap(),
            )
            .unwrap();

        let mid = graph
            .medial_id(&shared.to_string_lossy())
            .expect("medial interned");
        assert_eq!(graph.medial(mid).producers, vec![producer]);
        assert_eq!(graph.medial(mid).consumers, vec![consumer]);

        let deps = graph.dependency_map();
        assert_eq!(deps[&consumer], HashSet::from([producer]));
        assert!(deps[&producer].is_empty());

        let dependents = graph.dependent_map();
        assert_eq!(dependents[&producer], HashSet::from([consumer]));
    }

    #[test]
    fn double_producer_is_a_graph_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new("demo", dir.path());
        let shared = dir.path().join("scratch/shared.bin");
        let producer_def = def(vec![FieldDef::output("out", FieldType::Path)]);

        let mut graph = Graph::new();
        graph
            .add(
                Transform::new(
                    &producer_def,
                    &ctx,
                    "u",
                    "p0",
                    BTreeMap::from([("out".to_string(), path_value(&shared))]),
                )
                .unwrap(),
            )
            .unwrap();
        let error = graph
            .add(
                Transform::new(
                    &producer_def,
                    &ctx,
                    "u",
                    "p1",
                    BTreeMap::from([("out".to_string(), path_value(&shared))]),
                )
                .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(error, BuildGraphError::Graph(_)));
    }

    #[test]
    fn dangling_medials_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new("demo", dir.path());
        let missing = dir.path().join("never-created.bin");
        let consumer_def = def(vec![FieldDef::input("inp", FieldType::Path)]);

        let mut graph = Graph::new();
        graph
            .add(
                Transform::new(
                    &consumer_def,
                    &ctx,
                    "u",
                    "c",
                    BTreeMap::from([("inp".to_string(), path_value(&missing))]),
                )
                .unwrap(),
            )
            .unwrap();
        assert!(graph.validate().is_err());

        // Present on disk: no producer needed.
        std::fs::write(&missing, "data").unwrap();
        assert!(graph.validate().is_ok());
    }
}
