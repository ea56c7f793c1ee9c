//! Key-data objects: a JSON description of a stored transform, published
//! alongside its output blobs so the CLI can inspect and explain cache keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use buildgraph_graph::TraceNode;

/// Stored under `transform-<input hash>` whenever a transform's outputs are
/// pushed to a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformKeyData {
    /// Qualified transform label.
    pub transform: String,
    /// The transform's input hash (the key suffix).
    pub input_hash: String,
    /// Per output field, the content keys its medials were stored under.
    pub ifaces: BTreeMap<String, Vec<String>>,
    /// Hash trace, when the engine ran with tracing enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceNode>,
}
