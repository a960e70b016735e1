//! Test doubles shared by the strata integration tests.
//!
//! [`FakeStore`] and [`FakeBackend`] stand in for the image store and a
//! filesystem backend so provisioner behaviour can be exercised without
//! mounts or real images. [`TestContext`] wires them to a provisioner
//! rooted in a temporary directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata::{
    Backend, BackendRegistry, ImageName, Provisioner, ProvisionerOptions, ResolvedImage,
    StrataError, StrataResult, Store,
};
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Name the fake backend registers under unless told otherwise.
pub const FAKE_BACKEND: &str = "fake";

// ============================================================================
// FAKE STORE
// ============================================================================

/// In-memory image store.
///
/// Images map canonical references to layer ids. `get` can be held pending
/// with [`FakeStore::gated`] until [`FakeStore::open_gate`] is called.
pub struct FakeStore {
    layers_dir: PathBuf,
    images: Mutex<HashMap<String, Vec<String>>>,
    gate: Semaphore,
    gets: AtomicUsize,
    recovers: AtomicUsize,
    fail_recover: AtomicBool,
}

impl FakeStore {
    pub fn new(layers_dir: impl Into<PathBuf>) -> Self {
        let store = Self::gated(layers_dir);
        store.open_gate();
        store
    }

    /// A store whose `get` calls wait until the gate is opened.
    pub fn gated(layers_dir: impl Into<PathBuf>) -> Self {
        Self {
            layers_dir: layers_dir.into(),
            images: Mutex::new(HashMap::new()),
            gate: Semaphore::new(0),
            gets: AtomicUsize::new(0),
            recovers: AtomicUsize::new(0),
            fail_recover: AtomicBool::new(false),
        }
    }

    /// Release every pending and future `get`.
    pub fn open_gate(&self) {
        self.gate.close();
    }

    pub fn add_image(&self, name: &str, layers: &[&str]) {
        let reference = ImageName::parse(name)
            .map(|n| n.to_string())
            .unwrap_or_else(|_| name.to_string());
        self.images
            .lock()
            .insert(reference, layers.iter().map(|l| l.to_string()).collect());
    }

    pub fn fail_recover(&self, fail: bool) {
        self.fail_recover.store(fail, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn recover_calls(&self) -> usize {
        self.recovers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn get(&self, name: &str) -> StrataResult<ResolvedImage> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        // A closed semaphore means the gate is open.
        let _ = self.gate.acquire().await;

        let image_name = ImageName::parse(name)?;
        let layers = self
            .images
            .lock()
            .get(&image_name.to_string())
            .cloned()
            .ok_or_else(|| StrataError::Image(format!("image '{}' not found", image_name)))?;

        Ok(ResolvedImage {
            name: image_name,
            layers,
        })
    }

    async fn recover(&self) -> StrataResult<()> {
        self.recovers.fetch_add(1, Ordering::SeqCst);
        if self.fail_recover.load(Ordering::SeqCst) {
            return Err(StrataError::Storage("injected store recovery failure".into()));
        }
        Ok(())
    }

    fn layer_path(&self, layer_id: &str) -> PathBuf {
        self.layers_dir.join(layer_id)
    }
}

// ============================================================================
// FAKE BACKEND
// ============================================================================

/// Backend that creates plain directories and records every call.
///
/// `provision` writes the layer paths it was given, one per line, to
/// `{rootfs}/layers` so tests can check the order.
pub struct FakeBackend {
    name: String,
    provisions: Mutex<Vec<(Vec<PathBuf>, PathBuf)>>,
    destroys: Mutex<Vec<PathBuf>>,
    fail_provision: AtomicBool,
    fail_destroy: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::named(FAKE_BACKEND)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provisions: Mutex::new(Vec::new()),
            destroys: Mutex::new(Vec::new()),
            fail_provision: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
        }
    }

    pub fn fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// `(layers, rootfs)` of every provision call, in call order.
    pub fn provisions(&self) -> Vec<(Vec<PathBuf>, PathBuf)> {
        self.provisions.lock().clone()
    }

    /// Rootfs of every destroy call, in call order.
    pub fn destroys(&self) -> Vec<PathBuf> {
        self.destroys.lock().clone()
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision(&self, layers: &[PathBuf], rootfs: &Path) -> StrataResult<()> {
        self.provisions
            .lock()
            .push((layers.to_vec(), rootfs.to_path_buf()));

        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(StrataError::backend(&self.name, "injected provision failure"));
        }

        std::fs::create_dir_all(rootfs)?;
        let listing: Vec<String> = layers.iter().map(|l| l.display().to_string()).collect();
        std::fs::write(rootfs.join("layers"), listing.join("\n"))?;
        Ok(())
    }

    async fn destroy(&self, rootfs: &Path) -> StrataResult<bool> {
        self.destroys.lock().push(rootfs.to_path_buf());

        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(StrataError::backend(&self.name, "injected destroy failure"));
        }

        if !rootfs.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(rootfs)?;
        Ok(true)
    }
}

// ============================================================================
// TEST CONTEXT
// ============================================================================

/// A temporary work directory plus the fakes a provisioner runs against.
pub struct TestContext {
    pub temp: TempDir,
    pub store: Arc<FakeStore>,
    pub backend: Arc<FakeBackend>,
}

impl TestContext {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let store = Arc::new(FakeStore::new(temp.path().join("layers")));
        Self::with_store(temp, store)
    }

    /// Like [`TestContext::new`] but `get` blocks until the gate opens.
    pub fn gated() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let store = Arc::new(FakeStore::gated(temp.path().join("layers")));
        Self::with_store(temp, store)
    }

    fn with_store(temp: TempDir, store: Arc<FakeStore>) -> Self {
        store.add_image("library/nginx:1.9", &["L1", "L2"]);
        Self {
            temp,
            store,
            backend: Arc::new(FakeBackend::new()),
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    pub fn options(&self) -> ProvisionerOptions {
        ProvisionerOptions {
            work_dir: self.work_dir(),
            backend: FAKE_BACKEND.to_string(),
            store_dir: None,
            bind_mount_rootfs: false,
            log_to_file: false,
            copy_xattrs: true,
            ignore_chown_errors: true,
        }
    }

    /// Provisioner root, `{work_dir}/provisioner/docker`.
    pub fn root(&self) -> PathBuf {
        self.options().provisioner_dir()
    }

    pub fn registry(&self) -> BackendRegistry {
        let backend: Arc<dyn Backend> = self.backend.clone();
        std::iter::once(backend).collect()
    }

    pub fn provisioner(&self) -> StrataResult<Provisioner> {
        Provisioner::with_components(self.options(), self.store.clone(), self.registry())
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
