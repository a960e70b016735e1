//! Image references and descriptors.
//!
//! - `ImageName`: a parsed `[registry/]repository[:tag]` reference
//! - `Image`: the descriptor a caller hands to `provision`
//! - `ResolvedImage`: what a store returns, layers ordered base first

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strata_shared::constants::image::DEFAULT_TAG;
use strata_shared::errors::{StrataError, StrataResult};

// ============================================================================
// IMAGE NAME
// ============================================================================

/// Parsed image reference.
///
/// The tag is read from the last `:` of the final path component, so
/// `localhost:5000/app` has no tag. A registry is only split off when the
/// name has more than two `/`-separated components:
///
/// | input                        | registry             | repository       | tag     |
/// |------------------------------|----------------------|------------------|---------|
/// | `ubuntu`                     | -                    | `ubuntu`         | latest  |
/// | `library/ubuntu:16.04`       | -                    | `library/ubuntu` | `16.04` |
/// | `myregistry.com/lib/ubuntu`  | `myregistry.com/lib` | `ubuntu`         | latest  |
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageName {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl ImageName {
    pub fn parse(name: &str) -> StrataResult<Self> {
        if name.is_empty() {
            return Err(StrataError::InvalidArgument("empty image name".into()));
        }

        let last = name.rsplit('/').next().unwrap_or(name);
        let (base, tag) = match last.rfind(':') {
            Some(idx) => {
                let tag = &last[idx + 1..];
                (&name[..name.len() - last.len() + idx], tag)
            }
            None => (name, DEFAULT_TAG),
        };

        if tag.is_empty() {
            return Err(StrataError::InvalidArgument(format!(
                "image name '{name}' has an empty tag"
            )));
        }

        let (registry, repository) = match base.rsplit_once('/') {
            Some((registry, repository)) if base.split('/').count() > 2 => {
                (Some(registry.to_string()), repository)
            }
            _ => (None, base),
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(StrataError::InvalidArgument(format!(
                "image name '{name}' has an empty repository"
            )));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl FromStr for ImageName {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

// ============================================================================
// IMAGE DESCRIPTOR
// ============================================================================

/// Image format requested by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Docker,
    Appc,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Docker => f.write_str("docker"),
            ImageKind::Appc => f.write_str("appc"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerImageInfo {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppcImageInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Image mount request handed to `Provisioner::provision`.
///
/// `kind` selects which of the type-specific descriptors is meaningful.
/// A descriptor that does not match `kind` is ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub kind: ImageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appc: Option<AppcImageInfo>,
}

impl Image {
    pub fn docker(name: impl Into<String>) -> Self {
        Self {
            kind: ImageKind::Docker,
            docker: Some(DockerImageInfo { name: name.into() }),
            appc: None,
        }
    }

    pub fn appc(name: impl Into<String>) -> Self {
        Self {
            kind: ImageKind::Appc,
            docker: None,
            appc: Some(AppcImageInfo {
                name: name.into(),
                id: None,
            }),
        }
    }
}

// ============================================================================
// RESOLVED IMAGE
// ============================================================================

/// Store output: a locally available image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedImage {
    pub name: ImageName,
    /// Layer ids, base layer first.
    pub layers: Vec<String>,
}
