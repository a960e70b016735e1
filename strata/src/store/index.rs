//! Image index for tracking locally available images.
//!
//! Maps canonical image references to the layers they are made of. The
//! index only describes images; layer data lives under `layers/`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_shared::errors::{StrataError, StrataResult};
use strata_shared::layout::files;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Index of locally available images, serialized as JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageIndex {
    /// Schema version for future compatibility
    pub version: String,

    /// Map of canonical image reference -> cached image metadata
    pub images: HashMap<String, CachedImage>,
}

/// Metadata for a cached image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    /// Layer ids, base layer first
    pub layers: Vec<String>,

    /// When the image was imported (RFC 3339)
    pub cached_at: String,

    /// Whether every layer is present in the store
    pub complete: bool,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl ImageIndex {
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            images: HashMap::new(),
        }
    }

    /// Load index from `store_dir`.
    ///
    /// Returns an empty index if the file doesn't exist or is corrupted.
    pub fn load(store_dir: &Path) -> Self {
        let index_path = store_dir.join(files::INDEX);

        if !index_path.exists() {
            tracing::debug!("Index file not found, starting with an empty index");
            return Self::new();
        }

        match std::fs::read_to_string(&index_path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(index) => {
                    tracing::debug!("Loaded index with {} images", index.len());
                    index
                }
                Err(e) => {
                    tracing::warn!("Corrupted index file, starting over: {}", e);
                    Self::new()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read index file, starting over: {}", e);
                Self::new()
            }
        }
    }

    /// Save index to `store_dir`, replacing the previous file atomically.
    pub fn save(&self, store_dir: &Path) -> StrataResult<()> {
        let index_path = store_dir.join(files::INDEX);
        let tmp_path = index_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StrataError::Storage(format!("failed to serialize index: {e}")))?;

        std::fs::write(&tmp_path, json)
            .map_err(|e| StrataError::Storage(format!("failed to write index: {e}")))?;
        std::fs::rename(&tmp_path, &index_path)
            .map_err(|e| StrataError::Storage(format!("failed to replace index: {e}")))?;

        tracing::debug!("Saved index with {} images", self.images.len());
        Ok(())
    }

    pub fn get(&self, reference: &str) -> Option<&CachedImage> {
        self.images.get(reference)
    }

    /// Add or update a cached image
    pub fn upsert(&mut self, reference: String, image: CachedImage) {
        self.images.insert(reference, image);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
