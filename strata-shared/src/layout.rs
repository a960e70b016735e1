//! Filesystem layout names shared by the provisioner, store and backends.
//!
//! The provisioner root looks like:
//! ```text
//! {work_dir}/provisioner/{image_type}/
//! ├── .lock
//! └── containers/
//!     └── {container_id}/
//!         └── {backend}/
//!             └── {rootfs_id}/
//!                 └── rootfs/
//! ```
//!
//! The local image store looks like:
//! ```text
//! {store_dir}/
//! ├── index.json
//! ├── layers/
//! │   └── {layer_id}/
//! │       └── rootfs/
//! └── staging/
//! ```

/// Directory and file names.
pub mod dirs {
    /// Default base directory name under the user's home
    pub const STRATA_DIR: &str = ".strata";

    /// Provisioner directory under the work dir
    pub const PROVISIONER: &str = "provisioner";

    /// Image store directory under the work dir
    pub const STORE: &str = "store";

    /// Log directory under the work dir
    pub const LOGS: &str = "logs";

    /// Per-container directories under the provisioner root
    pub const CONTAINERS: &str = "containers";

    /// Assembled root filesystem inside a rootfs id directory
    pub const ROOTFS: &str = "rootfs";

    /// Layer directories under the store
    pub const LAYERS: &str = "layers";

    /// In-progress layer imports under the store
    pub const STAGING: &str = "staging";

    /// Overlayfs upper directory name (beside the rootfs)
    pub const UPPER: &str = "upper";

    /// Overlayfs work directory name (beside the rootfs)
    pub const WORK: &str = "work";
}

/// File names.
pub mod files {
    /// Exclusive lock file in the provisioner root
    pub const LOCK: &str = ".lock";

    /// Image index in the store directory
    pub const INDEX: &str = "index.json";

    /// Log file prefix for the rolling appender
    pub const LOG_PREFIX: &str = "strata.log";
}

/// Image type directory names under `{work_dir}/provisioner/`.
pub mod image_types {
    pub const DOCKER: &str = "docker";
    pub const APPC: &str = "appc";
}
