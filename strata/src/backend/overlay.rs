//! Overlay backend: stacks layers read-only under a per-rootfs upper dir.
//!
//! ```text
//! {rootfs_id}/
//! ├── rootfs/   overlayfs mount point
//! ├── upper/    container writes
//! └── work/     overlayfs scratch
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strata_shared::constants::backends;
use strata_shared::errors::{StrataError, StrataResult};
use strata_shared::layout::dirs;

use super::copy_mount::remove_path;
use super::registry::BackendRegistration;
use super::{Backend, ensure_parent};
use crate::util::mount;

#[derive(Debug, Default)]
pub struct OverlayBackend;

impl OverlayBackend {
    pub fn new() -> Self {
        Self
    }

    /// Fails unless the running kernel lists overlay in /proc/filesystems.
    pub fn detect() -> StrataResult<Self> {
        if !cfg!(target_os = "linux") {
            return Err(StrataError::Config(
                "overlay backend requires Linux".into(),
            ));
        }

        let filesystems = std::fs::read_to_string("/proc/filesystems")
            .map_err(|e| StrataError::Config(format!("failed to read /proc/filesystems: {}", e)))?;
        if !filesystems.lines().any(|line| line.trim_end().ends_with("overlay")) {
            return Err(StrataError::Config(
                "overlayfs is not supported by this kernel".into(),
            ));
        }

        Ok(Self)
    }
}

/// Upper and work directories that live beside `rootfs`.
fn scratch_dirs(rootfs: &Path) -> StrataResult<(PathBuf, PathBuf)> {
    let parent = rootfs.parent().ok_or_else(|| {
        StrataError::backend(
            backends::OVERLAY,
            format!("rootfs {} has no parent directory", rootfs.display()),
        )
    })?;
    Ok((parent.join(dirs::UPPER), parent.join(dirs::WORK)))
}

#[async_trait]
impl Backend for OverlayBackend {
    fn name(&self) -> &str {
        backends::OVERLAY
    }

    async fn provision(&self, layers: &[PathBuf], rootfs: &Path) -> StrataResult<()> {
        if layers.is_empty() {
            return Err(StrataError::backend(
                backends::OVERLAY,
                "cannot provision a rootfs with no layers",
            ));
        }

        let layers = layers.to_vec();
        let rootfs = rootfs.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let (upper, work) = scratch_dirs(&rootfs)?;
            ensure_parent(backends::OVERLAY, &rootfs)?;
            for dir in [&rootfs, &upper, &work] {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StrataError::backend(
                        backends::OVERLAY,
                        format!("failed to create {}: {}", dir.display(), e),
                    )
                })?;
            }

            if mount::is_mount_point(&rootfs)? {
                tracing::debug!(rootfs = %rootfs.display(), "Overlay already mounted");
                return Ok(());
            }

            mount::mount_overlay(&layers, &upper, &work, &rootfs)
                .map_err(|e| StrataError::backend(backends::OVERLAY, e))
        })
        .await
        .map_err(|e| StrataError::Internal(format!("overlay task failed: {}", e)))?
    }

    async fn destroy(&self, rootfs: &Path) -> StrataResult<bool> {
        let rootfs = rootfs.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let (upper, work) = scratch_dirs(&rootfs)?;
            let existed = [&rootfs, &upper, &work]
                .iter()
                .any(|dir| std::fs::symlink_metadata(dir).is_ok());

            mount::unmount(&rootfs).map_err(|e| StrataError::backend(backends::OVERLAY, e))?;
            for dir in [&rootfs, &upper, &work] {
                remove_path(dir).map_err(|e| StrataError::backend(backends::OVERLAY, e))?;
            }

            if existed {
                tracing::debug!(rootfs = %rootfs.display(), "Removed overlay rootfs");
            }
            Ok(existed)
        })
        .await
        .map_err(|e| StrataError::Internal(format!("overlay task failed: {}", e)))?
    }
}

inventory::submit! {
    BackendRegistration {
        name: backends::OVERLAY,
        factory: |_options| Ok(Arc::new(OverlayBackend::detect()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scratch_dirs_sit_beside_rootfs() {
        let (upper, work) = scratch_dirs(Path::new("/p/containers/c1/overlay/id/rootfs")).unwrap();
        assert_eq!(upper, PathBuf::from("/p/containers/c1/overlay/id/upper"));
        assert_eq!(work, PathBuf::from("/p/containers/c1/overlay/id/work"));
    }

    #[tokio::test]
    async fn test_provision_without_layers_fails() {
        let temp = TempDir::new().unwrap();
        let err = OverlayBackend::new()
            .provision(&[], &temp.path().join("id/rootfs"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_destroy_partial_state() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("id/rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::create_dir_all(temp.path().join("id/upper/etc")).unwrap();

        let backend = OverlayBackend::new();
        assert!(backend.destroy(&rootfs).await.unwrap());
        assert!(!rootfs.exists());
        assert!(!temp.path().join("id/upper").exists());
        assert!(!backend.destroy(&rootfs).await.unwrap());
    }
}
