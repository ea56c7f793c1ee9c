use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: strip `.` components and fold `..` into the
/// preceding component. Does not touch the filesystem, so it works for paths
/// that do not exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve a path to its canonical form. The path must exist.
pub fn resolve_strict(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(path)
}

/// Resolve a path to its canonical form when it exists, falling back to
/// lexical normalization for paths that have not been created yet (output
/// locations are resolved before anything produces them).
pub fn resolve_lenient(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| normalize_path(path))
}

/// Whether two paths refer to the same filesystem object. Falls back to a
/// lexical comparison when either path does not exist.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => normalize_path(a) == normalize_path(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dots() {
        assert_eq!(
            normalize_path(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_path(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn lenient_resolution_of_missing_path() {
        assert_eq!(
            resolve_lenient(Path::new("/definitely/missing/../path")),
            PathBuf::from("/definitely/path")
        );
    }

    #[test]
    fn same_file_on_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();
        let dotted = dir.path().join(".").join("f.txt");
        assert!(same_file(&file, &dotted));
        assert!(!same_file(&file, dir.path()));
    }
}
