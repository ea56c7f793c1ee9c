//! The input-hash engine.
//!
//! An input hash summarizes everything a transform's outputs depend on: the
//! module that implements it, its input field names in declaration order,
//! and the recursive input hash of every interface those fields carry. Host
//! path literals never reach a digest, so keys are portable across
//! machines with different checkout and scratch locations.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use buildgraph_core::{hash_content, BuildGraphError, IfaceSpec, ModuleHasher, Result};

use crate::graph::{Graph, MedialId, TransformId};

/// One node of a hash trace: what was digested, its own hash, and the
/// rolling digest state after it was folded in. Used by the CLI to explain
/// why a cache key changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    pub kind: String,
    pub ident: String,
    pub own_hash: String,
    pub rolling_hash: String,
    #[serde(default)]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    fn new(kind: &str, ident: impl Into<String>, own: &str, hasher: &Md5) -> Self {
        Self {
            kind: kind.to_string(),
            ident: ident.into(),
            own_hash: own.to_string(),
            rolling_hash: format!("{:x}", hasher.clone().finalize()),
            children: Vec::new(),
        }
    }
}

/// Memoizing hash engine over a frozen graph.
pub struct HashEngine {
    modules: ModuleHasher,
    transforms: Mutex<HashMap<TransformId, String>>,
    medials: Mutex<HashMap<MedialId, String>>,
    in_flight: Mutex<HashSet<TransformId>>,
    trace_enabled: bool,
    traces: Mutex<HashMap<TransformId, TraceNode>>,
}

impl HashEngine {
    pub fn new(modules: ModuleHasher) -> Self {
        Self {
            modules,
            transforms: Mutex::new(HashMap::new()),
            medials: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            trace_enabled: false,
            traces: Mutex::new(HashMap::new()),
        }
    }

    /// Record a trace node tree per transform alongside the hashes.
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// The input hash of a transform. Memoized after first computation.
    pub fn transform_hash(&self, graph: &Graph, tid: TransformId) -> Result<String> {
        if let Some(hash) = self.transforms.lock().get(&tid) {
            return Ok(hash.clone());
        }
        if !self.in_flight.lock().insert(tid) {
            return Err(BuildGraphError::Graph(format!(
                "input hash recursion detected through `{}`: the graph is cyclic",
                graph.transform(tid).label()
            )));
        }
        let result = self.compute_transform_hash(graph, tid);
        self.in_flight.lock().remove(&tid);
        let hash = result?;
        self.transforms.lock().insert(tid, hash.clone());
        Ok(hash)
    }

    fn compute_transform_hash(&self, graph: &Graph, tid: TransformId) -> Result<String> {
        let transform = graph.transform(tid);
        let mut hasher = Md5::new();
        let mut children = Vec::new();

        let module_hash = self.modules.hash_module(&transform.module);
        hasher.update(module_hash.as_bytes());
        if self.trace_enabled {
            children.push(TraceNode::new(
                "module",
                &transform.module,
                &module_hash,
                &hasher,
            ));
        }

        for entry in transform.input_ifaces() {
            hasher.update(entry.name.as_bytes());
            let (iface_hash, iface_children) = self.iface_hash_traced(graph, &entry.spec)?;
            hasher.update(iface_hash.as_bytes());
            if self.trace_enabled {
                let mut node = TraceNode::new("iface", &entry.name, &iface_hash, &hasher);
                node.children = iface_children;
                children.push(node);
            }
        }

        let digest = format!("{:x}", hasher.finalize());
        if self.trace_enabled {
            self.traces.lock().insert(
                tid,
                TraceNode {
                    kind: "transform".to_string(),
                    ident: transform.label(),
                    own_hash: digest.clone(),
                    rolling_hash: digest.clone(),
                    children,
                },
            );
        }
        Ok(digest)
    }

    /// The input hash of an interface: every hashable token, then the
    /// recursive hash of every referenced medial.
    pub fn iface_hash(&self, graph: &Graph, spec: &IfaceSpec) -> Result<String> {
        Ok(self.iface_hash_traced(graph, spec)?.0)
    }

    fn iface_hash_traced(
        &self,
        graph: &Graph,
        spec: &IfaceSpec,
    ) -> Result<(String, Vec<TraceNode>)> {
        let mut hasher = Md5::new();
        let mut children = Vec::new();

        for token in spec.hashable_tokens() {
            let encoded = serde_json::to_string(&token)?;
            hasher.update(encoded.as_bytes());
            if self.trace_enabled {
                let own = buildgraph_core::hash_str(&encoded);
                children.push(TraceNode::new("token", encoded, &own, &hasher));
            }
        }
        for val in &spec.medials {
            let mid = graph.medial_id(val).ok_or_else(|| {
                BuildGraphError::Graph(format!(
                    "medial `{val}` referenced by an interface is not part of the graph"
                ))
            })?;
            let medial_hash = self.medial_hash(graph, mid)?;
            hasher.update(medial_hash.as_bytes());
            if self.trace_enabled {
                children.push(TraceNode::new("medial", val, &medial_hash, &hasher));
            }
        }
        Ok((format!("{:x}", hasher.finalize()), children))
    }

    /// The input hash of a medial: the producing transform's input hash, or
    /// the content hash of a pre-existing filesystem object.
    pub fn medial_hash(&self, graph: &Graph, mid: MedialId) -> Result<String> {
        if let Some(hash) = self.medials.lock().get(&mid) {
            return Ok(hash.clone());
        }
        let medial = graph.medial(mid);
        let hash = match medial.producers.first() {
            Some(producer) => self.transform_hash(graph, *producer)?,
            None => hash_content(Path::new(&medial.val))?,
        };
        self.medials.lock().insert(mid, hash.clone());
        Ok(hash)
    }

    /// The recorded hash trace for a transform, when tracing is enabled and
    /// the hash has been computed.
    pub fn trace(&self, tid: TransformId) -> Option<TraceNode> {
        self.traces.lock().get(&tid).cloned()
    }
}
