//! Image stores: resolve image names to locally available layers.

mod index;
mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use strata_shared::errors::StrataResult;

use crate::image::ResolvedImage;

pub use index::{CachedImage, ImageIndex};
pub use local::LocalStore;

/// Resolves image names into ordered layer lists.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve `name`, fetching or caching layer data as needed.
    async fn get(&self, name: &str) -> StrataResult<ResolvedImage>;

    /// Reconcile on-disk cache state with the store's own bookkeeping.
    async fn recover(&self) -> StrataResult<()>;

    /// Directory a backend reads layer `layer_id` from.
    fn layer_path(&self, layer_id: &str) -> PathBuf;
}
