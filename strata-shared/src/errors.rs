//! Error types for the provisioner.
//!
//! Errors are categorized by how the caller is expected to react:
//! - Configuration: fatal at startup, never reaches a running provisioner
//! - Caller: rejected immediately, retrying the same request is pointless
//! - Consistency: persisted state and configuration disagree
//! - Transient: I/O failures, the caller may retry the whole operation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type StrataResult<T> = Result<T, StrataError>;

// ============================================================================
// Top-Level Error
// ============================================================================

#[derive(Debug, Error)]
pub enum StrataError {
    /// No usable backend, unregistered backend name, bad options.
    #[error("config: {0}")]
    Config(String),

    /// Unsupported image type, missing descriptor, malformed identifier.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An on-disk or bookkeeping entry references a backend that is not registered.
    #[error("unknown backend '{backend}': {context}")]
    UnknownBackend { backend: String, context: String },

    /// Directory creation, enumeration and other filesystem I/O.
    #[error("storage: {0}")]
    Storage(String),

    /// Image resolution failed in the store.
    #[error("image: {0}")]
    Image(String),

    /// A backend failed to assemble or tear down a rootfs.
    #[error("backend '{backend}': {message}")]
    Backend { backend: String, message: String },

    /// Bind mount or unmount failed.
    #[error("mount: {0}")]
    Mount(String),

    /// One or more rootfs destroys failed for a container.
    #[error(
        "failed to destroy {} rootfs(es) of container '{container_id}': {}",
        failures.len(),
        DisplayFailures(failures)
    )]
    Destroy {
        container_id: String,
        failures: Vec<RootfsFailure>,
    },

    /// Actor stopped, reply dropped, lock poisoned.
    #[error("internal: {0}")]
    Internal(String),
}

/// A single rootfs that could not be destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsFailure {
    pub backend: String,
    pub rootfs: PathBuf,
    pub message: String,
}

impl fmt::Display for RootfsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.rootfs.display(),
            self.backend,
            self.message
        )
    }
}

struct DisplayFailures<'a>(&'a [RootfsFailure]);

impl fmt::Display for DisplayFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, failure) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Categories
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Caller,
    Consistency,
    Transient,
}

impl StrataError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StrataError::Config(_) => ErrorCategory::Configuration,
            StrataError::InvalidArgument(_) => ErrorCategory::Caller,
            StrataError::UnknownBackend { .. } => ErrorCategory::Consistency,
            StrataError::Storage(_)
            | StrataError::Image(_)
            | StrataError::Backend { .. }
            | StrataError::Mount(_)
            | StrataError::Destroy { .. }
            | StrataError::Internal(_) => ErrorCategory::Transient,
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn unknown_backend(backend: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownBackend {
            backend: backend.into(),
            context: context.into(),
        }
    }

    pub fn backend(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<io::Error> for StrataError {
    fn from(err: io::Error) -> Self {
        StrataError::Storage(err.to_string())
    }
}
