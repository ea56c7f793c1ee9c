//! The reference file-backed cache: `<store>/key/<hex>` and
//! `<store>/content/<hex>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use buildgraph_core::{hash_bytes, Result};

use crate::cache::{key_digest, Cache};

type AcceptFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct FileCache {
    name: String,
    key_store: PathBuf,
    content_store: PathBuf,
    accepts: Option<AcceptFn>,
}

impl FileCache {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let key_store = root.join("key");
        let content_store = root.join("content");
        std::fs::create_dir_all(&key_store)?;
        std::fs::create_dir_all(&content_store)?;
        Ok(Self {
            name: name.into(),
            key_store,
            content_store,
            accepts: None,
        })
    }

    /// Restrict which keys this cache stores. Fetches are unaffected.
    pub fn with_accepts(mut self, accepts: AcceptFn) -> Self {
        self.accepts = Some(accepts);
        self
    }

    fn key_path(&self, key_hash: &str) -> PathBuf {
        self.key_store.join(key_digest(key_hash))
    }

    fn content_path(&self, content_hash: &str) -> PathBuf {
        self.content_store.join(content_hash)
    }
}

#[async_trait]
impl Cache for FileCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, key: &str) -> bool {
        match &self.accepts {
            Some(accepts) => (accepts.as_ref())(key),
            None => true,
        }
    }

    async fn store_hash(&self, key_hash: &str, content_hash: &str) -> Result<bool> {
        std::fs::write(self.key_path(key_hash), content_hash)?;
        Ok(true)
    }

    async fn drop_hash(&self, key_hash: &str) -> Result<bool> {
        let path = self.key_path(key_hash);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(true)
    }

    async fn fetch_hash(&self, key_hash: &str) -> Result<Option<String>> {
        let path = self.key_path(key_hash);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?.trim().to_string()))
    }

    async fn store_item(&self, content_hash: &str, frm: &Path) -> Result<bool> {
        let to = self.content_path(content_hash);
        if to.exists() {
            return Ok(true);
        }
        copy_tree(frm, &to)?;
        Ok(true)
    }

    async fn drop_item(&self, content_hash: &str) -> Result<bool> {
        let path = self.content_path(content_hash);
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(true)
    }

    async fn fetch_item(&self, content_hash: &str, to: &Path) -> Result<bool> {
        let frm = self.content_path(content_hash);
        if !frm.exists() {
            return Ok(false);
        }
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if to.is_dir() {
            std::fs::remove_dir_all(to)?;
        } else if to.exists() {
            std::fs::remove_file(to)?;
        }
        copy_tree(&frm, to)?;
        Ok(true)
    }

    async fn store_bytes(&self, bytes: &[u8]) -> Result<String> {
        let content_hash = hash_bytes(bytes);
        let to = self.content_path(&content_hash);
        if !to.exists() {
            std::fs::write(to, bytes)?;
        }
        Ok(content_hash)
    }

    async fn fetch_bytes(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        let path = self.content_path(content_hash);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }

    async fn iter_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.key_store)? {
            keys.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(keys)
    }
}

fn copy_tree(frm: &Path, to: &Path) -> std::io::Result<()> {
    if frm.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(frm)? {
            let entry = entry?;
            copy_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(frm, to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn files_round_trip_through_the_two_tables() {
        let store = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = FileCache::new("local", store.path()).unwrap();

        let original = work.path().join("built.bin");
        std::fs::write(&original, "payload").unwrap();
        assert!(cache.store("out-abc123", &original).await.unwrap());

        let restored = work.path().join("restored.bin");
        assert!(cache.fetch("out-abc123", &restored).await.unwrap());
        assert_eq!(std::fs::read_to_string(&restored).unwrap(), "payload");

        // A miss leaves nothing behind.
        let missing = work.path().join("missing.bin");
        assert!(!cache.fetch("no-such-key", &missing).await.unwrap());
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn directories_are_copied_recursively() {
        let store = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = FileCache::new("local", store.path()).unwrap();

        let tree = work.path().join("tree");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("a.txt"), "a").unwrap();
        std::fs::write(tree.join("nested/b.txt"), "b").unwrap();
        assert!(cache.store("tree-key", &tree).await.unwrap());

        let out = work.path().join("out");
        assert!(cache.fetch("tree-key", &out).await.unwrap());
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "a");
        assert_eq!(
            std::fs::read_to_string(out.join("nested/b.txt")).unwrap(),
            "b"
        );
    }

    #[tokio::test]
    async fn dropped_keys_stop_resolving() {
        let store = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = FileCache::new("local", store.path()).unwrap();

        let original = work.path().join("built.bin");
        std::fs::write(&original, "payload").unwrap();
        cache.store("key", &original).await.unwrap();
        assert!(cache.fetch_hash("key").await.unwrap().is_some());

        cache.drop_hash("key").await.unwrap();
        assert!(cache.fetch_hash("key").await.unwrap().is_none());
        // Dropping again is fine.
        cache.drop_hash("key").await.unwrap();
    }

    #[tokio::test]
    async fn objects_round_trip() {
        let store = tempfile::tempdir().unwrap();
        let cache = FileCache::new("local", store.path()).unwrap();
        let object = serde_json::json!({"transform": "demo::Concat", "fields": ["out"]});
        assert!(cache.store_object("transform-ff00", &object).await.unwrap());
        assert_eq!(
            cache.fetch_object("transform-ff00").await.unwrap(),
            Some(object)
        );
        assert_eq!(cache.fetch_object("transform-0000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn accept_policies_gate_keys() {
        let store = tempfile::tempdir().unwrap();
        let cache = FileCache::new("local", store.path())
            .unwrap()
            .with_accepts(Arc::new(|key| key.starts_with("netlist-")));
        assert!(cache.accepts("netlist-abc"));
        assert!(!cache.accepts("waves-abc"));
    }
}
