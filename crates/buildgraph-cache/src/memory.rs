//! An in-memory cache that snapshots file and directory trees. Primarily a
//! test double, but fetches genuinely materialize, so workflow scenarios
//! exercise the same paths as a real backend.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;

use buildgraph_core::{hash_bytes, Result};

use crate::cache::Cache;

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<String, Node>),
}

impl Node {
    fn snapshot(path: &Path) -> std::io::Result<Node> {
        if path.is_dir() {
            let mut entries = BTreeMap::new();
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                entries.insert(
                    entry.file_name().to_string_lossy().into_owned(),
                    Node::snapshot(&entry.path())?,
                );
            }
            Ok(Node::Dir(entries))
        } else {
            Ok(Node::File(std::fs::read(path)?))
        }
    }

    fn materialize(&self, to: &Path) -> std::io::Result<()> {
        match self {
            Node::File(bytes) => {
                if let Some(parent) = to.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(to, bytes)
            }
            Node::Dir(entries) => {
                std::fs::create_dir_all(to)?;
                for (name, node) in entries {
                    node.materialize(&to.join(name))?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryCache {
    name: String,
    keys: Mutex<HashMap<String, String>>,
    content: Mutex<HashMap<String, Node>>,
}

impl MemoryCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Mutex::new(HashMap::new()),
            content: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.lock().len()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store_hash(&self, key_hash: &str, content_hash: &str) -> Result<bool> {
        self.keys
            .lock()
            .insert(key_hash.to_string(), content_hash.to_string());
        Ok(true)
    }

    async fn drop_hash(&self, key_hash: &str) -> Result<bool> {
        self.keys.lock().remove(key_hash);
        Ok(true)
    }

    async fn fetch_hash(&self, key_hash: &str) -> Result<Option<String>> {
        Ok(self.keys.lock().get(key_hash).cloned())
    }

    async fn store_item(&self, content_hash: &str, frm: &Path) -> Result<bool> {
        let mut content = self.content.lock();
        if !content.contains_key(content_hash) {
            content.insert(content_hash.to_string(), Node::snapshot(frm)?);
        }
        Ok(true)
    }

    async fn drop_item(&self, content_hash: &str) -> Result<bool> {
        self.content.lock().remove(content_hash);
        Ok(true)
    }

    async fn fetch_item(&self, content_hash: &str, to: &Path) -> Result<bool> {
        let node = match self.content.lock().get(content_hash) {
            Some(node) => node.clone(),
            None => return Ok(false),
        };
        node.materialize(to)?;
        Ok(true)
    }

    async fn store_bytes(&self, bytes: &[u8]) -> Result<String> {
        let content_hash = hash_bytes(bytes);
        self.content
            .lock()
            .entry(content_hash.clone())
            .or_insert_with(|| Node::File(bytes.to_vec()));
        Ok(content_hash)
    }

    async fn fetch_bytes(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        match self.content.lock().get(content_hash) {
            Some(Node::File(bytes)) => Ok(Some(bytes.clone())),
            _ => Ok(None),
        }
    }

    async fn iter_keys(&self) -> Result<Vec<String>> {
        Ok(self.keys.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshots_materialize_faithfully() {
        let work = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new("mem");

        let tree = work.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub/data.txt"), "payload").unwrap();
        cache.store("key", &tree).await.unwrap();

        // The original can disappear entirely.
        std::fs::remove_dir_all(&tree).unwrap();
        let out = work.path().join("out");
        assert!(cache.fetch("key", &out).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(out.join("sub/data.txt")).unwrap(),
            "payload"
        );
    }
}
