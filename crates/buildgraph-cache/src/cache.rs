//! The content-addressable cache protocol.
//!
//! A cache is two tables: `key hash -> content hash` and `content hash ->
//! blob`. The key hash is computable before anything runs; the content hash
//! is the digest of the produced bytes. Backends implement the six
//! primitives; the combined store/fetch operations (with rollback and miss
//! cleanup) are provided.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use buildgraph_core::{hash_bytes, hash_content, Result};

/// Known prefix for transform key-data objects, used by the CLI inspection
/// commands.
pub const TRANSFORM_PREFIX: &str = "transform-";

#[async_trait]
pub trait Cache: Send + Sync {
    /// Human-readable identity for logs and the CLI.
    fn name(&self) -> &str;

    /// Store policy: whether this cache wants the given key. Opaque to the
    /// engine; fetches are unaffected.
    fn accepts(&self, _key: &str) -> bool {
        true
    }

    /// Record `key_hash -> content_hash`. True if stored or already present.
    async fn store_hash(&self, key_hash: &str, content_hash: &str) -> Result<bool>;

    /// Remove a key entry. Must tolerate missing keys.
    async fn drop_hash(&self, key_hash: &str) -> Result<bool>;

    /// Look up the content hash for a key, or None.
    async fn fetch_hash(&self, key_hash: &str) -> Result<Option<String>>;

    /// Place a blob in the content table. True if stored or already present
    /// (two keys may map to identical content).
    async fn store_item(&self, content_hash: &str, frm: &Path) -> Result<bool>;

    /// Remove a blob. Must tolerate missing values and directory trees.
    async fn drop_item(&self, content_hash: &str) -> Result<bool>;

    /// Materialize a blob at `to`. True on success.
    async fn fetch_item(&self, content_hash: &str, to: &Path) -> Result<bool>;

    /// Store raw bytes in the content table, returning their content hash.
    async fn store_bytes(&self, bytes: &[u8]) -> Result<String>;

    /// Read a blob back as bytes, or None if absent.
    async fn fetch_bytes(&self, content_hash: &str) -> Result<Option<Vec<u8>>>;

    /// Keys currently present, for inspection tooling. Optional.
    async fn iter_keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Store a file or directory under a key: content first, then the key
    /// entry, rolling the content back if the key write fails.
    async fn store(&self, key: &str, frm: &Path) -> Result<bool> {
        let content_hash = hash_content(frm)?;
        if self.store_item(&content_hash, frm).await? {
            if self.store_hash(key, &content_hash).await? {
                return Ok(true);
            }
            self.drop_item(&content_hash).await?;
        }
        Ok(false)
    }

    /// Fetch a file or directory by key, cleaning up on a miss.
    async fn fetch(&self, key: &str, to: &Path) -> Result<bool> {
        if let Some(content_hash) = self.fetch_hash(key).await? {
            if self.fetch_item(&content_hash, to).await? {
                return Ok(true);
            }
        }
        if to.is_file() {
            let _ = std::fs::remove_file(to);
        }
        Ok(false)
    }

    /// Store a JSON object under a key, through the same two tables.
    async fn store_object(&self, key: &str, value: &JsonValue) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        let content_hash = self.store_bytes(&bytes).await?;
        if self.store_hash(key, &content_hash).await? {
            return Ok(true);
        }
        self.drop_item(&content_hash).await?;
        Ok(false)
    }

    /// Fetch a JSON object by key, or None on a miss.
    async fn fetch_object(&self, key: &str) -> Result<Option<JsonValue>> {
        let Some(content_hash) = self.fetch_hash(key).await? else {
            return Ok(None);
        };
        let Some(bytes) = self.fetch_bytes(&content_hash).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// The hex filename a key string is stored under. Keys are arbitrary
/// strings; the digest keeps the key table flat and filesystem-safe.
pub fn key_digest(key: &str) -> String {
    hash_bytes(key.as_bytes())
}
