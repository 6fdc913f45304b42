//! Per-request output storage.
//!
//! Every generation request gets its own directory under a shared root, named
//! by a unique key, so concurrent requests never write to the same files.

use crate::error::MeshError;
use crate::export::MeshPaths;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// File stem used for both mesh files inside a request directory.
pub const MESH_STEM: &str = "model";

const MAX_ALLOCATION_ATTEMPTS: usize = 16;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique identifier of one request's output directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("{nanos:x}-{:x}-{sequence:x}", std::process::id()))
    }

    /// Parse a key received from a client. Only lowercase hex digits and dashes are accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c == '-' || c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Root directory that hands out per-request mesh locations.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh request directory and return its key and mesh paths.
    pub fn allocate(&self) -> Result<(StorageKey, MeshPaths), MeshError> {
        fs::create_dir_all(&self.root)?;
        let mut attempts = 0;
        loop {
            let key = StorageKey::generate();
            let dir = self.root.join(key.as_str());
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!("Allocated output directory {}", dir.display());
                    return Ok((key, MeshPaths::in_dir(&dir, MESH_STEM)));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if attempts >= MAX_ALLOCATION_ATTEMPTS {
                        return Err(err.into());
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Remove a request directory and everything in it.
    pub fn discard(&self, key: &StorageKey) -> Result<(), MeshError> {
        let dir = self.root.join(key.as_str());
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
            debug!("Discarded output directory {}", dir.display());
        }
        Ok(())
    }

    /// Mesh paths for an existing key, if its directory exists.
    pub fn resolve(&self, key: &StorageKey) -> Option<MeshPaths> {
        let dir = self.root.join(key.as_str());
        dir.is_dir().then(|| MeshPaths::in_dir(&dir, MESH_STEM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_allocate_unique_directories() {
        let root = tempdir().unwrap();
        let store = OutputStore::new(root.path());

        let (a, paths_a) = store.allocate().unwrap();
        let (b, paths_b) = store.allocate().unwrap();
        assert_ne!(a, b);
        assert_ne!(paths_a.obj, paths_b.obj);
        assert!(paths_a.obj.ends_with(format!("{}/model.obj", a)));
        assert!(paths_b.glb.ends_with(format!("{}/model.glb", b)));
        assert_eq!(store.resolve(&a), Some(paths_a));

        store.discard(&b).unwrap();
        assert!(store.resolve(&b).is_none());
    }

    #[test]
    fn test_parse_rejects_path_traversal() {
        assert!(StorageKey::parse("../etc").is_none());
        assert!(StorageKey::parse("a/b").is_none());
        assert!(StorageKey::parse("").is_none());
        assert_eq!(
            StorageKey::parse("18f3a-2b-0").map(|k| k.to_string()),
            Some("18f3a-2b-0".to_string())
        );
    }

    #[test]
    fn test_resolve_missing_key() {
        let root = tempdir().unwrap();
        let store = OutputStore::new(root.path().join("missing"));
        let key = StorageKey::parse("dead-beef").unwrap();
        assert!(store.resolve(&key).is_none());
    }
}
