//! Bind backend: exposes a single-layer image read-only without copying.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strata_shared::constants::backends;
use strata_shared::errors::{StrataError, StrataResult};

use super::registry::BackendRegistration;
use super::{Backend, ensure_parent};
use crate::util::mount;

#[derive(Debug, Default)]
pub struct BindBackend;

impl BindBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for BindBackend {
    fn name(&self) -> &str {
        backends::BIND
    }

    async fn provision(&self, layers: &[PathBuf], rootfs: &Path) -> StrataResult<()> {
        let [layer] = layers else {
            return Err(StrataError::backend(
                backends::BIND,
                format!("requires exactly one layer, got {}", layers.len()),
            ));
        };

        let layer = layer.clone();
        let rootfs = rootfs.to_path_buf();

        tokio::task::spawn_blocking(move || {
            if !layer.is_dir() {
                return Err(StrataError::backend(
                    backends::BIND,
                    format!("layer directory does not exist: {}", layer.display()),
                ));
            }

            ensure_parent(backends::BIND, &rootfs)?;
            std::fs::create_dir_all(&rootfs).map_err(|e| {
                StrataError::backend(
                    backends::BIND,
                    format!("failed to create {}: {}", rootfs.display(), e),
                )
            })?;

            if mount::is_mount_point(&rootfs)? {
                tracing::debug!(rootfs = %rootfs.display(), "Layer already bind mounted");
                return Ok(());
            }

            mount::bind_mount_readonly(&layer, &rootfs)
                .map_err(|e| StrataError::backend(backends::BIND, e))?;
            tracing::info!(
                layer = %layer.display(),
                rootfs = %rootfs.display(),
                "Bind mounted layer read-only"
            );
            Ok(())
        })
        .await
        .map_err(|e| StrataError::Internal(format!("bind task failed: {}", e)))?
    }

    async fn destroy(&self, rootfs: &Path) -> StrataResult<bool> {
        let rootfs = rootfs.to_path_buf();

        tokio::task::spawn_blocking(move || {
            mount::unmount(&rootfs).map_err(|e| StrataError::backend(backends::BIND, e))?;

            // Never recursive: a mount that is still attached would expose the layer itself.
            match std::fs::remove_dir(&rootfs) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StrataError::backend(
                    backends::BIND,
                    format!("failed to remove mount point {}: {}", rootfs.display(), e),
                )),
            }
        })
        .await
        .map_err(|e| StrataError::Internal(format!("bind task failed: {}", e)))?
    }
}

inventory::submit! {
    BackendRegistration {
        name: backends::BIND,
        factory: |_options| {
            if cfg!(target_os = "linux") {
                Ok(Arc::new(BindBackend::new()))
            } else {
                Err(StrataError::Config("bind backend requires Linux".into()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_provision_rejects_multiple_layers() {
        let temp = TempDir::new().unwrap();
        let layers = vec![temp.path().join("l1"), temp.path().join("l2")];

        let err = BindBackend::new()
            .provision(&layers, &temp.path().join("rootfs"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exactly one layer"));
    }

    #[tokio::test]
    async fn test_destroy_unmounted_target() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("id/rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();

        let backend = BindBackend::new();
        assert!(backend.destroy(&rootfs).await.unwrap());
        assert!(!backend.destroy(&rootfs).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_refuses_populated_directory() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::write(rootfs.join("data"), "keep").unwrap();

        assert!(BindBackend::new().destroy(&rootfs).await.is_err());
        assert!(rootfs.join("data").exists());
    }
}
