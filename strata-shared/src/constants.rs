//! Shared constants for the provisioner and its collaborators.

/// Image related constants
pub mod image {
    /// Tag used when an image reference does not carry one
    pub const DEFAULT_TAG: &str = "latest";
}

/// Backend names known to the registry.
pub mod backends {
    /// Copy-based backend (portable, no mounts)
    pub const COPY: &str = "copy";

    /// Overlayfs backend (Linux only)
    pub const OVERLAY: &str = "overlay";

    /// Read-only bind mount backend (Linux only, single layer)
    pub const BIND: &str = "bind";

    /// Backend selected when the configuration does not name one
    pub const DEFAULT: &str = COPY;
}

/// Environment variables
pub mod envs {
    /// Overrides the default work directory
    pub const STRATA_HOME: &str = "STRATA_HOME";

    /// Log filter for the file logger (falls back to `RUST_LOG`)
    pub const STRATA_LOG: &str = "STRATA_LOG";
}
