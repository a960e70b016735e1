//! Copy backend: physically copies every layer into the rootfs.
//!
//! Works on any host and needs no privileges, at the cost of disk space
//! and provisioning time proportional to image size.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strata_shared::constants::backends;
use strata_shared::errors::{StrataError, StrataResult};
use walkdir::WalkDir;

use super::copy_mount::{self, CopyOptions};
use super::registry::BackendRegistration;
use super::{Backend, ensure_parent};

#[derive(Debug, Default)]
pub struct CopyBackend {
    options: CopyOptions,
}

impl CopyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: CopyOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Backend for CopyBackend {
    fn name(&self) -> &str {
        backends::COPY
    }

    async fn provision(&self, layers: &[PathBuf], rootfs: &Path) -> StrataResult<()> {
        let layers = layers.to_vec();
        let rootfs = rootfs.to_path_buf();
        let options = self.options;

        tracing::info!(
            rootfs = %rootfs.display(),
            layers = layers.len(),
            "Provisioning rootfs by copy"
        );

        tokio::task::spawn_blocking(move || {
            ensure_parent(backends::COPY, &rootfs)?;
            copy_mount::assemble(&layers, &rootfs, options)
                .map_err(|e| StrataError::backend(backends::COPY, e))
        })
        .await
        .map_err(|e| StrataError::Internal(format!("copy task failed: {}", e)))?
    }

    async fn destroy(&self, rootfs: &Path) -> StrataResult<bool> {
        let rootfs = rootfs.to_path_buf();

        tokio::task::spawn_blocking(move || remove_tree(&rootfs))
            .await
            .map_err(|e| StrataError::Internal(format!("copy task failed: {}", e)))?
            .map_err(|e| StrataError::backend(backends::COPY, e))
    }
}

/// Remove a copied rootfs. Returns `false` if it did not exist.
///
/// Layers may contain read-only directories, which block removal of their
/// children for unprivileged users; those are made writable and the
/// removal retried once.
fn remove_tree(rootfs: &Path) -> StrataResult<bool> {
    if fs::symlink_metadata(rootfs).is_err() {
        return Ok(false);
    }

    match fs::remove_dir_all(rootfs) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            make_dirs_writable(rootfs);
            copy_mount::remove_path(rootfs)?;
        }
        Err(e) => {
            return Err(StrataError::Storage(format!(
                "Failed to remove rootfs {}: {}",
                rootfs.display(),
                e
            )));
        }
    }

    tracing::debug!(rootfs = %rootfs.display(), "Removed copied rootfs");
    Ok(true)
}

fn make_dirs_writable(root: &Path) {
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            let mode = metadata.permissions().mode();
            let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700));
        }
    }
}

inventory::submit! {
    BackendRegistration {
        name: backends::COPY,
        factory: |options| Ok(Arc::new(CopyBackend::with_options(options.copy))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_layer(root: &Path, name: &str, file: &str, content: &str) -> PathBuf {
        let layer = root.join("layers").join(name).join("rootfs");
        fs::create_dir_all(&layer).unwrap();
        fs::write(layer.join(file), content).unwrap();
        layer
    }

    #[tokio::test]
    async fn test_provision_and_destroy() {
        let temp = TempDir::new().unwrap();
        let l1 = make_layer(temp.path(), "l1", "a", "1");
        let l2 = make_layer(temp.path(), "l2", "b", "2");
        let rootfs = temp.path().join("containers/c1/copy/id/rootfs");

        let backend = CopyBackend::new();
        backend.provision(&[l1, l2], &rootfs).await.unwrap();

        assert_eq!(fs::read_to_string(rootfs.join("a")).unwrap(), "1");
        assert_eq!(fs::read_to_string(rootfs.join("b")).unwrap(), "2");

        assert!(backend.destroy(&rootfs).await.unwrap());
        assert!(!rootfs.exists());
        assert!(!backend.destroy(&rootfs).await.unwrap());
    }

    #[tokio::test]
    async fn test_provision_missing_layer_is_backend_error() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");

        let err = CopyBackend::new()
            .provision(&[temp.path().join("nope")], &rootfs)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Backend { ref backend, .. } if backend == "copy"));
    }

    #[tokio::test]
    async fn test_destroy_read_only_tree() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("ro")).unwrap();
        fs::write(rootfs.join("ro/file"), "x").unwrap();
        fs::set_permissions(rootfs.join("ro"), fs::Permissions::from_mode(0o555)).unwrap();

        assert!(CopyBackend::new().destroy(&rootfs).await.unwrap());
        assert!(!rootfs.exists());
    }
}
