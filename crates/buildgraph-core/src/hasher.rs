//! Content hashing for files, directories and symlinks, plus the coarse
//! module-level hash used to invalidate transform outputs when the engine's
//! own code changes.
//!
//! Hashes are 128-bit MD5 digests, hex encoded. The choice is throughput,
//! not security: keys only need to separate accidental collisions and the
//! format must stay stable across hosts.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{BuildGraphError, Result};
use crate::paths::normalize_path;

/// Hash an in-memory string.
pub fn hash_str(data: &str) -> String {
    format!("{:x}", Md5::digest(data.as_bytes()))
}

/// Hash an in-memory byte buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Hash the content of a file or directory. This must be consistent across
/// cache backends so consistency checks can compare digests.
///
/// Policy:
/// - A symlink whose target does not exist hashes the literal string
///   `<symlink to {target}>` (dangling links are legal interface values).
/// - A directory hashes the tag `<dir>` followed by each entry name and its
///   recursive content hash, in sorted name order.
/// - A regular file hashes its bytes.
pub fn hash_content(path: &Path) -> Result<String> {
    if !path.exists() {
        let is_symlink = std::fs::symlink_metadata(path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            return Err(BuildGraphError::Hashing(format!(
                "tried to hash a path that does not exist `{}`",
                path.display()
            )));
        }
        let target = resolve_link(path)?;
        return Ok(hash_str(&format!("<symlink to {}>", target.display())));
    }

    if path.is_dir() {
        let mut hasher = Md5::new();
        hasher.update(b"<dir>");
        let mut entries = std::fs::read_dir(path)?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = hash_content(&entry.path())?;
            hasher.update(name.as_bytes());
            hasher.update(child.as_bytes());
        }
        return Ok(format!("{:x}", hasher.finalize()));
    }

    let mut hasher = Md5::new();
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn resolve_link(path: &Path) -> Result<PathBuf> {
    let target = std::fs::read_link(path)?;
    if target.is_absolute() {
        return Ok(normalize_path(&target));
    }
    let base = path.parent().unwrap_or_else(|| Path::new("/"));
    Ok(normalize_path(&base.join(target)))
}

/// Produces the per-module hash folded into every transform input hash as a
/// proxy for "the code that implements this transform changed".
///
/// The fingerprint defaults to the running executable's path and mtime, the
/// compiled-code analog of hashing loaded source files and their timestamps.
/// Tests override it to keep hashes stable across rebuilds.
pub struct ModuleHasher {
    fingerprint: OnceCell<String>,
    override_fingerprint: Option<String>,
    memo: Mutex<HashMap<String, String>>,
}

impl ModuleHasher {
    pub fn new() -> Self {
        Self {
            fingerprint: OnceCell::new(),
            override_fingerprint: None,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: OnceCell::new(),
            override_fingerprint: Some(fingerprint.into()),
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Hash a module identifier. Memoized per module.
    pub fn hash_module(&self, module: &str) -> String {
        if let Some(hash) = self.memo.lock().get(module) {
            return hash.clone();
        }
        let fingerprint = self.fingerprint();
        let hash = hash_str(&format!("{fingerprint}{module}"));
        self.memo.lock().insert(module.to_string(), hash.clone());
        hash
    }

    fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| {
            if let Some(fp) = &self.override_fingerprint {
                return fp.clone();
            }
            executable_fingerprint().unwrap_or_else(|error| {
                warn!(%error, "could not fingerprint the running executable");
                "unknown".to_string()
            })
        })
    }
}

impl Default for ModuleHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn executable_fingerprint() -> std::io::Result<String> {
    let exe = std::env::current_exe()?;
    let modified = std::fs::metadata(&exe)?.modified()?;
    let stamp = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    Ok(format!("{}{}", exe.display(), stamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hello").unwrap();
        let first = hash_content(&file).unwrap();
        let second = hash_content(&file).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);

        std::fs::write(&file, "world").unwrap();
        assert_ne!(first, hash_content(&file).unwrap());
    }

    #[test]
    fn directory_hash_covers_entries_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let first = hash_content(dir.path()).unwrap();

        // Same content in a fresh directory hashes identically, regardless of
        // creation order.
        let other = tempfile::tempdir().unwrap();
        std::fs::write(other.path().join("a.txt"), "a").unwrap();
        std::fs::write(other.path().join("b.txt"), "b").unwrap();
        assert_eq!(first, hash_content(other.path()).unwrap());

        std::fs::write(other.path().join("c.txt"), "c").unwrap();
        assert_ne!(first, hash_content(other.path()).unwrap());
    }

    #[test]
    fn missing_path_is_a_hashing_error() {
        let error = hash_content(Path::new("/no/such/path")).unwrap_err();
        assert!(matches!(error, BuildGraphError::Hashing(_)));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_hashes_its_target() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/nowhere/in/particular", &link).unwrap();
        let hash = hash_content(&link).unwrap();
        assert_eq!(hash, hash_str("<symlink to /nowhere/in/particular>"));
    }

    #[test]
    fn module_hash_memoizes_and_separates_modules() {
        let hasher = ModuleHasher::with_fingerprint("fp");
        let a = hasher.hash_module("demo::a");
        assert_eq!(a, hasher.hash_module("demo::a"));
        assert_ne!(a, hasher.hash_module("demo::b"));

        let other = ModuleHasher::with_fingerprint("fp2");
        assert_ne!(a, other.hash_module("demo::a"));
    }
}
