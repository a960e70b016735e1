//! Strata shared - common code for the provisioner and its collaborators
//!
//! This crate contains the error taxonomy and the on-disk layout names
//! used by the provisioner, the image store and the filesystem backends.

pub mod constants;
pub mod errors;
pub mod layout;

pub use errors::{ErrorCategory, RootfsFailure, StrataError, StrataResult};
