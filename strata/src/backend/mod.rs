//! Filesystem backends that turn an ordered list of layers into a rootfs.
//!
//! Backends register themselves at compile time (see [`registry`]) and are
//! instantiated once at startup into an immutable [`BackendRegistry`].

mod bind;
mod copy;
pub(crate) mod copy_mount;
mod overlay;
pub mod registry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strata_shared::errors::{StrataError, StrataResult};

use crate::options::BackendOptions;

pub use bind::BindBackend;
pub use copy::CopyBackend;
pub use copy_mount::CopyOptions;
pub use overlay::OverlayBackend;
pub use registry::{BackendRegistration, available_backends, create_backends, is_registered};

/// A strategy for assembling and tearing down a rootfs.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registry name, also used as the backend directory name on disk.
    fn name(&self) -> &str;

    /// Assemble `rootfs` from `layers`, base layer first.
    ///
    /// Creates `rootfs` (and any missing parents). Calling it again on an
    /// already provisioned target must leave a usable rootfs behind.
    async fn provision(&self, layers: &[PathBuf], rootfs: &Path) -> StrataResult<()>;

    /// Release everything associated with `rootfs`.
    ///
    /// Partially built or already removed targets are fine. Returns `false`
    /// when there was nothing to remove.
    async fn destroy(&self, rootfs: &Path) -> StrataResult<bool>;
}

/// Immutable name -> backend map, built once at startup.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new(backends: BTreeMap<String, Arc<dyn Backend>>) -> Self {
        Self { backends }
    }

    /// Instantiate every registered backend usable on this host.
    pub fn from_options(options: &BackendOptions) -> Self {
        Self::new(create_backends(options))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}

impl FromIterator<Arc<dyn Backend>> for BackendRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Backend>>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|backend| (backend.name().to_string(), backend))
                .collect(),
        )
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Create the parent directory of `rootfs` for a backend.
pub(crate) fn ensure_parent(backend: &str, rootfs: &Path) -> StrataResult<()> {
    if let Some(parent) = rootfs.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StrataError::backend(
                backend,
                format!(
                    "failed to create directory {} for rootfs: {}",
                    parent.display(),
                    e
                ),
            )
        })?;
    }
    Ok(())
}
