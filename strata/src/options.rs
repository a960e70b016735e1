//! Configuration for the provisioner.

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_shared::constants::{backends, envs};
use strata_shared::errors::{StrataError, StrataResult};
use strata_shared::layout::{dirs as layout_dirs, image_types};

use crate::backend::CopyOptions;

/// Options used when constructing a `Provisioner`.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```json
/// { "work_dir": "/var/lib/strata", "backend": "overlay" }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvisionerOptions {
    /// Base directory for provisioner state, store and logs.
    ///
    /// Defaults to `$STRATA_HOME`, else `~/.strata`.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Name of the backend used for new rootfses.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Image store directory. `None` means `{work_dir}/store`.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Bind mount each rootfs onto itself after assembly so mounts layered
    /// by the caller stay under the rootfs when it pivots. Needs
    /// CAP_SYS_ADMIN; only honoured on Linux.
    #[serde(default = "default_bind_mount_rootfs")]
    pub bind_mount_rootfs: bool,

    /// Write rolling log files to `{work_dir}/logs`.
    #[serde(default = "default_log_to_file")]
    pub log_to_file: bool,

    /// Carry `security.capability`, `user.*` and overlay-opaque xattrs
    /// into rootfses assembled by the copy backend.
    #[serde(default = "default_true")]
    pub copy_xattrs: bool,

    /// Keep going when the copy backend cannot restore file ownership,
    /// as happens for unprivileged provisioners.
    #[serde(default = "default_true")]
    pub ignore_chown_errors: bool,
}

fn default_work_dir() -> PathBuf {
    std::env::var(envs::STRATA_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(layout_dirs::STRATA_DIR);
            path
        })
}

fn default_backend() -> String {
    backends::DEFAULT.to_string()
}

fn default_bind_mount_rootfs() -> bool {
    cfg!(target_os = "linux")
}

fn default_log_to_file() -> bool {
    true
}

fn default_true() -> bool {
    true
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            backend: default_backend(),
            store_dir: None,
            bind_mount_rootfs: default_bind_mount_rootfs(),
            log_to_file: default_log_to_file(),
            copy_xattrs: true,
            ignore_chown_errors: true,
        }
    }
}

impl ProvisionerOptions {
    /// Options rooted at `work_dir` with everything else defaulted.
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }

    /// Load options from a JSON file.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!(
                "failed to read options file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&contents).map_err(|e| {
            StrataError::Config(format!(
                "failed to parse options file {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn validate(&self) -> StrataResult<()> {
        if !self.work_dir.is_absolute() {
            return Err(StrataError::Config(format!(
                "work_dir must be absolute path, got: {}",
                self.work_dir.display()
            )));
        }

        if self.backend.is_empty() {
            return Err(StrataError::Config("backend name must not be empty".into()));
        }

        if let Some(store_dir) = &self.store_dir
            && !store_dir.is_absolute()
        {
            return Err(StrataError::Config(format!(
                "store_dir must be absolute path, got: {}",
                store_dir.display()
            )));
        }

        Ok(())
    }

    /// Provisioner root for docker images: `{work_dir}/provisioner/docker`
    pub fn provisioner_dir(&self) -> PathBuf {
        self.work_dir
            .join(layout_dirs::PROVISIONER)
            .join(image_types::DOCKER)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(layout_dirs::STORE))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.work_dir.join(layout_dirs::LOGS)
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            copy: CopyOptions {
                copy_xattrs: self.copy_xattrs,
                ignore_chown_errors: self.ignore_chown_errors,
            },
        }
    }
}

/// Configuration handed to backend factories.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    /// How the copy backend carries file metadata over.
    pub copy: CopyOptions,
}
