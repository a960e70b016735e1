//! Provisioner directory layout.
//!
//! ```text
//! {root}/containers/{container_id}/{backend}/{rootfs_id}/rootfs
//! ```
//!
//! The directory tree is the source of truth for `recover`: bookkeeping is
//! always re-derived from what these helpers find on disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strata_shared::errors::{StrataError, StrataResult};
use strata_shared::layout::dirs;

// ============================================================================
// CONTAINER ID
// ============================================================================

/// Caller supplied container identifier.
///
/// Used as a directory name, so it must be a single non-empty path component.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(value: impl Into<String>) -> StrataResult<Self> {
        let value = value.into();
        if value.is_empty() || value == "." || value == ".." || value.contains('/') {
            return Err(StrataError::InvalidArgument(format!(
                "invalid container id '{value}'"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = StrataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

// ============================================================================
// PATH COMPUTATION
// ============================================================================

pub fn containers_dir(root: &Path) -> PathBuf {
    root.join(dirs::CONTAINERS)
}

pub fn container_dir(root: &Path, container_id: &ContainerId) -> PathBuf {
    containers_dir(root).join(container_id.as_str())
}

pub fn backend_dir(root: &Path, container_id: &ContainerId, backend: &str) -> PathBuf {
    container_dir(root, container_id).join(backend)
}

/// `{root}/containers/{cid}/{backend}/{rootfs_id}`
pub fn rootfs_dir(
    root: &Path,
    container_id: &ContainerId,
    backend: &str,
    rootfs_id: &str,
) -> PathBuf {
    backend_dir(root, container_id, backend).join(rootfs_id)
}

/// `{root}/containers/{cid}/{backend}/{rootfs_id}/rootfs`
///
/// This is the path recorded in bookkeeping and handed back to the caller.
pub fn container_rootfs(
    root: &Path,
    container_id: &ContainerId,
    backend: &str,
    rootfs_id: &str,
) -> PathBuf {
    rootfs_dir(root, container_id, backend, rootfs_id).join(dirs::ROOTFS)
}

// ============================================================================
// ENUMERATION
// ============================================================================

/// List containers that have provisioner state under `root`.
///
/// A missing `containers/` directory means nothing was provisioned yet.
pub fn list_containers(root: &Path) -> StrataResult<BTreeMap<ContainerId, PathBuf>> {
    let containers = containers_dir(root);
    let mut result = BTreeMap::new();

    for (name, path) in list_subdirs(&containers)? {
        match ContainerId::new(name.clone()) {
            Ok(id) => {
                result.insert(id, path);
            }
            Err(_) => {
                tracing::warn!(
                    entry = %path.display(),
                    "Ignoring unexpected entry in containers directory"
                );
            }
        }
    }

    Ok(result)
}

/// List rootfses of a container, grouped by backend.
///
/// Returns `backend -> rootfs_id -> {rootfs_id dir}/rootfs`.
pub fn list_container_rootfses(
    root: &Path,
    container_id: &ContainerId,
) -> StrataResult<BTreeMap<String, BTreeMap<String, PathBuf>>> {
    let container = container_dir(root, container_id);
    let mut result = BTreeMap::new();

    for (backend, _) in list_subdirs(&container)? {
        let mut rootfses = BTreeMap::new();
        for (rootfs_id, _) in list_subdirs(&backend_dir(root, container_id, &backend))? {
            let path = container_rootfs(root, container_id, &backend, &rootfs_id);
            rootfses.insert(rootfs_id, path);
        }
        result.insert(backend, rootfses);
    }

    Ok(result)
}

/// Remove a container's directory tree once all its rootfses are destroyed.
///
/// Missing directories are not an error.
pub fn remove_container_dir(root: &Path, container_id: &ContainerId) -> StrataResult<()> {
    let dir = container_dir(root, container_id);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::Storage(format!(
            "failed to remove container directory {}: {}",
            dir.display(),
            e
        ))),
    }
}

fn list_subdirs(dir: &Path) -> StrataResult<Vec<(String, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StrataError::Storage(format!(
                "failed to list {}: {}",
                dir.display(),
                e
            )));
        }
    };

    let mut result = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            StrataError::Storage(format!("failed to read entry in {}: {}", dir.display(), e))
        })?;

        let file_type = entry.file_type().map_err(|e| {
            StrataError::Storage(format!(
                "failed to stat {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        if !file_type.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        result.push((name, entry.path()));
    }

    result.sort();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn cid(value: &str) -> ContainerId {
        ContainerId::new(value).unwrap()
    }

    #[test]
    fn test_container_id_validation() {
        assert!(ContainerId::new("c1").is_ok());
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("..").is_err());
        assert!(ContainerId::new("a/b").is_err());
    }

    #[test]
    fn test_rootfs_path_layout() {
        let root = Path::new("/var/lib/strata/provisioner/docker");
        let path = container_rootfs(root, &cid("c1"), "copy", "abc");
        assert_eq!(
            path,
            PathBuf::from("/var/lib/strata/provisioner/docker/containers/c1/copy/abc/rootfs")
        );
    }

    #[test]
    fn test_list_containers_without_directory() {
        let temp = TempDir::new().unwrap();
        assert!(list_containers(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_list_container_rootfses() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::create_dir_all(rootfs_dir(root, &cid("c1"), "copy", "r1")).unwrap();
        fs::create_dir_all(container_rootfs(root, &cid("c1"), "copy", "r2")).unwrap();
        fs::create_dir_all(rootfs_dir(root, &cid("c1"), "overlay", "r3")).unwrap();
        fs::create_dir_all(rootfs_dir(root, &cid("c2"), "copy", "r4")).unwrap();
        // Stray files are not rootfses
        fs::write(backend_dir(root, &cid("c1"), "copy").join("note"), "x").unwrap();

        let containers = list_containers(root).unwrap();
        assert_eq!(
            containers.keys().cloned().collect::<Vec<_>>(),
            vec![cid("c1"), cid("c2")]
        );

        let rootfses = list_container_rootfses(root, &cid("c1")).unwrap();
        assert_eq!(rootfses.len(), 2);
        assert_eq!(rootfses["copy"].len(), 2);
        assert_eq!(
            rootfses["copy"]["r1"],
            container_rootfs(root, &cid("c1"), "copy", "r1")
        );
        assert_eq!(rootfses["overlay"].len(), 1);
    }

    #[test]
    fn test_remove_container_dir_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(rootfs_dir(root, &cid("c1"), "copy", "r1")).unwrap();

        remove_container_dir(root, &cid("c1")).unwrap();
        assert!(!container_dir(root, &cid("c1")).exists());
        remove_container_dir(root, &cid("c1")).unwrap();
    }
}
