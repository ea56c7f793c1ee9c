//! Multi-cache fan-out and the per-transform store/fetch policy.
//!
//! Caches are ordered: fetches return the first hit, stores fan out to
//! every cache whose policy accepts the key. Errors from individual caches
//! are logged and demoted to "skip this cache" — a cache going away must
//! never fail a build. The one exception is determinism mode, where a
//! content-hash mismatch is fatal by design.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use buildgraph_core::{hash_content, BuildGraphError, Result};
use buildgraph_graph::{Graph, HashEngine, TransformId};

use crate::cache::{Cache, TRANSFORM_PREFIX};
use crate::keydata::TransformKeyData;

#[derive(Clone, Default)]
pub struct CacheHub {
    caches: Vec<Arc<dyn Cache>>,
    determinism: bool,
}

impl CacheHub {
    pub fn new(caches: Vec<Arc<dyn Cache>>) -> Self {
        Self {
            caches,
            determinism: false,
        }
    }

    /// Audit mode: never pull or push, instead assert that freshly produced
    /// content matches what every cache recorded for the same key.
    pub fn with_determinism(mut self) -> Self {
        self.determinism = true;
        self
    }

    pub fn enabled(&self) -> bool {
        !self.caches.is_empty()
    }

    pub fn determinism(&self) -> bool {
        self.determinism
    }

    pub fn caches(&self) -> &[Arc<dyn Cache>] {
        &self.caches
    }

    /// Pull from the first cache that has the key.
    pub async fn fetch_from_any(&self, key: &str, to: &Path) -> bool {
        for cache in &self.caches {
            match cache.fetch(key, to).await {
                Ok(true) => {
                    debug!(key, cache = cache.name(), "cache hit");
                    return true;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(key, cache = cache.name(), %error, "cache fetch failed");
                }
            }
            if to.is_file() {
                let _ = std::fs::remove_file(to);
            }
        }
        false
    }

    /// Store to every cache whose policy accepts the key. True if at least
    /// one accepted.
    pub async fn store_to_any(&self, key: &str, frm: &Path) -> bool {
        let mut stored_somewhere = false;
        for cache in &self.caches {
            if !cache.accepts(key) {
                continue;
            }
            match cache.store(key, frm).await {
                Ok(true) => stored_somewhere = true,
                Ok(false) => {}
                Err(error) => {
                    warn!(key, cache = cache.name(), %error, "cache store failed");
                }
            }
        }
        stored_somewhere
    }

    /// Fetch a JSON object from the first cache that has it, optionally
    /// restricted to one named cache.
    pub async fn fetch_object(
        &self,
        key: &str,
        from_cache: Option<&str>,
    ) -> Option<(String, JsonValue)> {
        for cache in &self.caches {
            if let Some(name) = from_cache {
                if cache.name() != name {
                    continue;
                }
            }
            match cache.fetch_object(key).await {
                Ok(Some(value)) => return Some((cache.name().to_string(), value)),
                Ok(None) => {}
                Err(error) => {
                    warn!(key, cache = cache.name(), %error, "cache object fetch failed");
                }
            }
        }
        None
    }

    /// Try to satisfy every output interface of a transform from the caches.
    /// True only if every output medial was fetched.
    pub async fn fetch_transform(
        &self,
        graph: &Graph,
        hashes: &HashEngine,
        tid: TransformId,
    ) -> Result<bool> {
        if self.determinism {
            return Ok(false);
        }
        let transform = graph.transform(tid);
        for entry in transform.output_ifaces() {
            for val in &entry.spec.medials {
                let key = self.medial_key(graph, hashes, &entry.name, val)?;
                if !self.fetch_from_any(&key, Path::new(val)).await {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Store every output interface of a transform. In determinism mode,
    /// assert the fresh content hashes match every cache's records instead.
    pub async fn store_transform(
        &self,
        graph: &Graph,
        hashes: &HashEngine,
        tid: TransformId,
    ) -> Result<bool> {
        let transform = graph.transform(tid);

        if self.determinism {
            for entry in transform.output_ifaces() {
                for val in &entry.spec.medials {
                    let key = self.medial_key(graph, hashes, &entry.name, val)?;
                    let fresh = hash_content(Path::new(val))?;
                    for cache in &self.caches {
                        match cache.fetch_hash(&key).await {
                            Ok(Some(cached)) if cached == fresh => {}
                            Ok(Some(cached)) => {
                                return Err(BuildGraphError::Determinism(format!(
                                    "transform `{}` output `{val}` hashed to \
                                     {fresh} but cache '{}' recorded {cached} \
                                     for key `{key}`",
                                    transform.label(),
                                    cache.name()
                                )));
                            }
                            Ok(None) => {
                                return Err(BuildGraphError::Determinism(format!(
                                    "transform `{}` output `{val}`: cache '{}' \
                                     has no content hash for key `{key}` to \
                                     compare against",
                                    transform.label(),
                                    cache.name()
                                )));
                            }
                            Err(error) => {
                                warn!(key, cache = cache.name(), %error, "cache hash fetch failed");
                            }
                        }
                    }
                }
            }
            return Ok(false);
        }

        let mut key_data = TransformKeyData {
            transform: transform.label(),
            input_hash: hashes.transform_hash(graph, tid)?,
            ifaces: BTreeMap::new(),
            trace: hashes.trace(tid),
        };
        for entry in transform.output_ifaces() {
            for val in &entry.spec.medials {
                let key = self.medial_key(graph, hashes, &entry.name, val)?;
                if !self.store_to_any(&key, Path::new(val)).await {
                    return Ok(false);
                }
                key_data
                    .ifaces
                    .entry(entry.name.clone())
                    .or_default()
                    .push(key);
            }
        }

        // Publish the key-data object for inspection tooling. Best effort:
        // losing it never fails the build.
        let key = format!("{TRANSFORM_PREFIX}{}", key_data.input_hash);
        let object = serde_json::to_value(&key_data)?;
        for cache in &self.caches {
            if !cache.accepts(&key) {
                continue;
            }
            if let Err(error) = cache.store_object(&key, &object).await {
                warn!(key, cache = cache.name(), %error, "key data store failed");
            }
        }
        info!(transform = %transform.label(), "stored transform outputs");
        Ok(true)
    }

    fn medial_key(
        &self,
        graph: &Graph,
        hashes: &HashEngine,
        field: &str,
        val: &str,
    ) -> Result<String> {
        let mid = graph.medial_id(val).ok_or_else(|| {
            BuildGraphError::Graph(format!("medial `{val}` is not part of the graph"))
        })?;
        Ok(format!("{field}-{}", hashes.medial_hash(graph, mid)?))
    }
}
