//! Directory-backed image store.
//!
//! ```text
//! {store_dir}/
//! ├── index.json              reference -> layers
//! ├── layers/{id}/rootfs/     layer content
//! └── staging/                in-progress imports
//! ```
//!
//! Layers are imported from local directories; there is no registry client.
//! A layer becomes visible only once it has been fully copied into staging
//! and renamed into `layers/`. Layers are stored verbatim, whiteout markers
//! included.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_shared::errors::{StrataError, StrataResult};
use strata_shared::layout::dirs;
use tokio::sync::RwLock;

use super::Store;
use super::index::{CachedImage, ImageIndex};
use crate::backend::copy_mount::{self, CopyOptions};
use crate::image::{ImageName, ResolvedImage};

pub struct LocalStore {
    store_dir: PathBuf,
    index: RwLock<ImageIndex>,
    /// One lock per reference being imported.
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("store_dir", &self.store_dir)
            .finish()
    }
}

impl LocalStore {
    /// Open (creating if needed) the store at `store_dir`.
    pub fn new(store_dir: impl Into<PathBuf>) -> StrataResult<Self> {
        let store_dir = store_dir.into();
        for dir in [
            store_dir.join(dirs::LAYERS),
            store_dir.join(dirs::STAGING),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StrataError::Storage(format!(
                    "failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let index = ImageIndex::load(&store_dir);
        Ok(Self {
            store_dir,
            index: RwLock::new(index),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    fn layers_dir(&self) -> PathBuf {
        self.store_dir.join(dirs::LAYERS)
    }

    fn staging_dir(&self) -> PathBuf {
        self.store_dir.join(dirs::STAGING)
    }

    /// Import an image whose layers are plain directories on this host.
    ///
    /// `layers` are `(layer id, source directory)` pairs, base layer first.
    /// Layers already in the store are reused. Concurrent imports of the
    /// same reference run one at a time and the later ones reuse the
    /// layers the first one copied.
    pub async fn import(
        &self,
        name: &str,
        layers: Vec<(String, PathBuf)>,
    ) -> StrataResult<ResolvedImage> {
        let image_name = ImageName::parse(name)?;
        let reference = image_name.to_string();

        if layers.is_empty() {
            return Err(StrataError::InvalidArgument(format!(
                "image '{reference}' has no layers"
            )));
        }
        for (id, _) in &layers {
            validate_layer_id(id)?;
        }

        let slot = self.in_flight_slot(&reference);
        let result = {
            let _guard = slot.lock().await;
            self.import_locked(image_name, &reference, layers).await
        };
        self.release_slot(&reference, slot);
        result
    }

    async fn import_locked(
        &self,
        image_name: ImageName,
        reference: &str,
        layers: Vec<(String, PathBuf)>,
    ) -> StrataResult<ResolvedImage> {
        let layer_ids: Vec<String> = layers.iter().map(|(id, _)| id.clone()).collect();
        let layers_dir = self.layers_dir();
        let staging_dir = self.staging_dir();

        tracing::info!(
            image = %reference,
            layers = layers.len(),
            "Importing image into store"
        );

        tokio::task::spawn_blocking(move || import_layers(&layers, &layers_dir, &staging_dir))
            .await
            .map_err(|e| StrataError::Internal(format!("import task failed: {}", e)))??;

        let mut index = self.index.write().await;
        index.upsert(
            reference.to_string(),
            CachedImage {
                layers: layer_ids.clone(),
                cached_at: chrono::Utc::now().to_rfc3339(),
                complete: true,
            },
        );
        index.save(&self.store_dir)?;

        Ok(ResolvedImage {
            name: image_name,
            layers: layer_ids,
        })
    }

    fn in_flight_slot(&self, reference: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(reference.to_string())
            .or_default()
            .clone()
    }

    fn release_slot(&self, reference: &str, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock();
        // Two references: ours and the map's. Anyone else still waiting keeps it.
        if Arc::strong_count(&slot) <= 2 {
            in_flight.remove(reference);
        }
    }
}

fn validate_layer_id(id: &str) -> StrataResult<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') {
        return Err(StrataError::InvalidArgument(format!(
            "invalid layer id '{id}'"
        )));
    }
    Ok(())
}

/// Copy every missing layer into `layers_dir`, in parallel.
fn import_layers(
    layers: &[(String, PathBuf)],
    layers_dir: &Path,
    staging_dir: &Path,
) -> StrataResult<()> {
    use rayon::prelude::*;

    layers
        .par_iter()
        .try_for_each(|(id, source)| import_layer(id, source, layers_dir, staging_dir))
}

fn import_layer(
    id: &str,
    source: &Path,
    layers_dir: &Path,
    staging_dir: &Path,
) -> StrataResult<()> {
    let dest = layers_dir.join(id);
    if dest.join(dirs::ROOTFS).is_dir() {
        tracing::debug!(layer = id, "Layer already in store");
        return Ok(());
    }

    let staged = staging_dir.join(uuid::Uuid::new_v4().to_string());
    let rootfs = staged.join(dirs::ROOTFS);
    let result = copy_mount::copy_layer(source, &rootfs, CopyOptions::default()).and_then(|()| {
        std::fs::rename(&staged, &dest).or_else(|e| {
            // Another import of the same layer won the rename.
            if dest.join(dirs::ROOTFS).is_dir() {
                Ok(())
            } else {
                Err(StrataError::Storage(format!(
                    "failed to move layer {} into place: {}",
                    id, e
                )))
            }
        })
    });

    if staged.exists() {
        let _ = copy_mount::remove_path(&staged);
    }
    result?;

    tracing::debug!(layer = id, "Imported layer");
    Ok(())
}

#[async_trait]
impl Store for LocalStore {
    async fn get(&self, name: &str) -> StrataResult<ResolvedImage> {
        let image_name = ImageName::parse(name)?;
        let reference = image_name.to_string();

        let layers = {
            let index = self.index.read().await;
            match index.get(&reference) {
                Some(cached) if cached.complete => cached.layers.clone(),
                Some(_) => {
                    return Err(StrataError::Image(format!(
                        "image '{reference}' is incomplete in the store"
                    )));
                }
                None => {
                    return Err(StrataError::Image(format!(
                        "image '{reference}' not found in the store"
                    )));
                }
            }
        };

        if let Some(missing) = layers.iter().find(|id| !self.layer_path(id).is_dir()) {
            return Err(StrataError::Image(format!(
                "layer '{missing}' of image '{reference}' is missing"
            )));
        }

        tracing::debug!(image = %reference, layers = layers.len(), "Resolved image");
        Ok(ResolvedImage {
            name: image_name,
            layers,
        })
    }

    async fn recover(&self) -> StrataResult<()> {
        let staging = self.staging_dir();
        if staging.exists() {
            copy_mount::remove_path(&staging)?;
        }
        std::fs::create_dir_all(&staging).map_err(|e| {
            StrataError::Storage(format!(
                "failed to recreate staging dir {}: {}",
                staging.display(),
                e
            ))
        })?;

        let mut loaded = ImageIndex::load(&self.store_dir);
        let mut incomplete = 0;
        for (reference, cached) in loaded.images.iter_mut() {
            if cached.complete && cached.layers.iter().any(|id| !self.layer_path(id).is_dir()) {
                tracing::warn!(image = %reference, "Image has missing layers, marking incomplete");
                cached.complete = false;
                incomplete += 1;
            }
        }
        loaded.save(&self.store_dir)?;

        tracing::info!(
            images = loaded.len(),
            incomplete,
            "Recovered image store"
        );
        *self.index.write().await = loaded;
        Ok(())
    }

    fn layer_path(&self, layer_id: &str) -> PathBuf {
        self.layers_dir().join(layer_id).join(dirs::ROOTFS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn source_layer(root: &Path, id: &str, file: &str) -> (String, PathBuf) {
        let dir = root.join("src").join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), id).unwrap();
        (id.to_string(), dir)
    }

    #[tokio::test]
    async fn test_import_then_get() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("store")).unwrap();
        let layers = vec![
            source_layer(temp.path(), "L1", "a"),
            source_layer(temp.path(), "L2", "b"),
        ];

        store.import("library/nginx:1.9", layers).await.unwrap();

        let resolved = store.get("library/nginx:1.9").await.unwrap();
        assert_eq!(resolved.layers, vec!["L1", "L2"]);
        assert_eq!(resolved.name.repository, "library/nginx");
        assert!(store.layer_path("L1").join("a").exists());
        assert!(store.layer_path("L2").join("b").exists());
    }

    #[tokio::test]
    async fn test_get_normalises_default_tag() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("store")).unwrap();
        store
            .import("busybox", vec![source_layer(temp.path(), "B1", "sh")])
            .await
            .unwrap();

        assert!(store.get("busybox:latest").await.is_ok());
        assert!(matches!(
            store.get("busybox:1.36").await.unwrap_err(),
            StrataError::Image(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_imports_share_layers() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(temp.path().join("store")).unwrap());
        let layers = vec![source_layer(temp.path(), "L1", "a")];

        let (a, b) = tokio::join!(
            store.import("app:v1", layers.clone()),
            store.import("app:v1", layers.clone())
        );
        a.unwrap();
        b.unwrap();

        assert!(store.in_flight.lock().is_empty());
        let staged: Vec<_> = fs::read_dir(temp.path().join("store/staging"))
            .unwrap()
            .collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_bad_layer_ids() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("store")).unwrap();

        let err = store
            .import("app", vec![("../x".to_string(), temp.path().to_path_buf())])
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_recover_marks_missing_layers_and_clears_staging() {
        let temp = TempDir::new().unwrap();
        let store_dir = temp.path().join("store");
        let store = LocalStore::new(&store_dir).unwrap();
        store
            .import("app:v1", vec![source_layer(temp.path(), "L1", "a")])
            .await
            .unwrap();

        fs::remove_dir_all(store_dir.join("layers/L1")).unwrap();
        fs::create_dir_all(store_dir.join("staging/leftover")).unwrap();

        let reopened = LocalStore::new(&store_dir).unwrap();
        reopened.recover().await.unwrap();

        assert!(!store_dir.join("staging/leftover").exists());
        assert!(matches!(
            reopened.get("app:v1").await.unwrap_err(),
            StrataError::Image(msg) if msg.contains("incomplete")
        ));
        assert!(!ImageIndex::load(&store_dir).get("app:v1").unwrap().complete);
    }

    #[tokio::test]
    async fn test_recover_with_corrupt_index() {
        let temp = TempDir::new().unwrap();
        let store_dir = temp.path().join("store");
        let store = LocalStore::new(&store_dir).unwrap();
        fs::write(store_dir.join("index.json"), "{").unwrap();

        store.recover().await.unwrap();
        assert!(ImageIndex::load(&store_dir).is_empty());
    }

    #[tokio::test]
    async fn test_import_keeps_whiteouts_for_assembly() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("store")).unwrap();
        let base = source_layer(temp.path(), "base", "shadow");
        let top = source_layer(temp.path(), "top", ".wh.shadow");

        store.import("app:v1", vec![base, top]).await.unwrap();

        assert!(store.layer_path("top").join(".wh.shadow").exists());

        let rootfs = temp.path().join("rootfs");
        copy_mount::assemble(
            &[store.layer_path("base"), store.layer_path("top")],
            &rootfs,
            CopyOptions::default(),
        )
        .unwrap();
        assert!(!rootfs.join("shadow").exists());
    }
}
