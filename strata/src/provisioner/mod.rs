//! Provisioner facade.
//!
//! [`Provisioner`] is the only handle the rest of the agent holds. Each call
//! is queued on the actor before the method returns, and the returned
//! future only waits for the reply. Calls are therefore ordered by when
//! they were made, not by when their futures are first polled.

mod process;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use strata_shared::errors::{StrataError, StrataResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::BackendRegistry;
use crate::image::Image;
use crate::lock::ProvisionerLock;
use crate::options::ProvisionerOptions;
use crate::paths::ContainerId;
use crate::store::{LocalStore, Store};
use crate::util::init_logging;

pub use process::Info;
use process::{ProvisionerProcess, ProvisionerRequest};

/// Handle to a running provisioning actor.
///
/// Dropping the handle closes the actor's mailbox; requests already queued
/// are still answered.
pub struct Provisioner {
    sender: mpsc::UnboundedSender<ProvisionerRequest>,
    actor: JoinHandle<()>,
    root: PathBuf,
    backend: String,
    _lock: ProvisionerLock,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("root", &self.root)
            .field("backend", &self.backend)
            .finish()
    }
}

impl Provisioner {
    /// Create a provisioner with every registered backend and a [`LocalStore`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `Config` if the options are invalid, no backend is usable on this
    ///   host, or the configured backend is not among them
    /// - `Internal` if another provisioner already uses the same root
    /// - `Storage` if the root or the store cannot be created
    pub fn create(options: ProvisionerOptions) -> StrataResult<Self> {
        options.validate()?;
        if options.log_to_file {
            init_logging(&options.logs_dir())?;
        }

        let backends = BackendRegistry::from_options(&options.backend_options());
        let store = LocalStore::new(options.store_dir()).map_err(|e| {
            StrataError::Config(format!("failed to create image store: {}", e))
        })?;

        Self::start(options, Arc::new(store), backends)
    }

    /// Create a provisioner with caller-supplied collaborators.
    pub fn with_components(
        options: ProvisionerOptions,
        store: Arc<dyn Store>,
        backends: BackendRegistry,
    ) -> StrataResult<Self> {
        options.validate()?;
        if options.log_to_file {
            init_logging(&options.logs_dir())?;
        }

        Self::start(options, store, backends)
    }

    fn start(
        options: ProvisionerOptions,
        store: Arc<dyn Store>,
        backends: BackendRegistry,
    ) -> StrataResult<Self> {
        if backends.is_empty() {
            return Err(StrataError::Config(
                "no usable provisioner backend created".into(),
            ));
        }
        if !backends.contains(&options.backend) {
            return Err(StrataError::Config(format!(
                "the specified provisioner backend '{}' is unsupported, available: {:?}",
                options.backend,
                backends.names()
            )));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            StrataError::Internal(format!("provisioner requires a tokio runtime: {}", e))
        })?;

        let root = prepare_root(&options.provisioner_dir())?;
        let lock = ProvisionerLock::acquire(&root)?;

        let process = ProvisionerProcess::new(
            root.clone(),
            options.backend.clone(),
            options.bind_mount_rootfs,
            backends,
            store,
        );
        let (sender, mailbox) = mpsc::unbounded_channel();
        let actor = runtime.spawn(process.run(mailbox));

        tracing::info!(
            root = %root.display(),
            backend = %options.backend,
            bind_mount_rootfs = options.bind_mount_rootfs,
            "Provisioner created"
        );

        Ok(Self {
            sender,
            actor,
            root,
            backend: options.backend,
            _lock: lock,
        })
    }

    /// Canonical provisioner root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backend used for new rootfses.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Rebuild bookkeeping from disk.
    ///
    /// Containers in `live` or `orphans` are adopted; any other container
    /// found on disk is destroyed on a best-effort basis. Fails if a rootfs
    /// belongs to an unregistered backend or the store fails to recover.
    pub fn recover(
        &self,
        live: HashSet<ContainerId>,
        orphans: HashSet<ContainerId>,
    ) -> BoxFuture<'static, StrataResult<()>> {
        self.dispatch(|reply| ProvisionerRequest::Recover {
            live,
            orphans,
            reply,
        })
    }

    /// Provision a new rootfs for `container_id` and return its path.
    ///
    /// A container may be provisioned several times; each call adds a
    /// rootfs under a fresh id. Nothing is rolled back on failure, the
    /// next `destroy` or `recover` cleans up.
    pub fn provision(
        &self,
        container_id: ContainerId,
        image: Image,
    ) -> BoxFuture<'static, StrataResult<PathBuf>> {
        self.dispatch(|reply| ProvisionerRequest::Provision {
            container_id,
            image,
            reply,
        })
    }

    /// Destroy every rootfs of `container_id`.
    ///
    /// Returns `false` if the container is unknown.
    pub fn destroy(
        &self,
        container_id: ContainerId,
    ) -> BoxFuture<'static, StrataResult<bool>> {
        self.dispatch(|reply| ProvisionerRequest::Destroy {
            container_id,
            reply,
        })
    }

    /// Snapshot of the current bookkeeping.
    pub fn containers(
        &self,
    ) -> BoxFuture<'static, StrataResult<HashMap<ContainerId, Info>>> {
        self.dispatch(|reply| ProvisionerRequest::Containers { reply })
    }

    /// Close the mailbox and wait for the actor to drain it.
    ///
    /// Store and backend work already handed off keeps running and still
    /// answers its callers.
    pub async fn shutdown(self) -> StrataResult<()> {
        let Self {
            sender,
            actor,
            _lock: lock,
            ..
        } = self;
        drop(sender);

        actor
            .await
            .map_err(|e| StrataError::Internal(format!("provisioner actor failed: {}", e)))?;

        tracing::info!("Provisioner stopped");
        drop(lock);
        Ok(())
    }

    fn dispatch<T: Send + 'static>(
        &self,
        request: impl FnOnce(oneshot::Sender<StrataResult<T>>) -> ProvisionerRequest,
    ) -> BoxFuture<'static, StrataResult<T>> {
        let (reply, response) = oneshot::channel();
        let sent = self.sender.send(request(reply)).is_ok();

        async move {
            if !sent {
                return Err(StrataError::Internal("provisioner is not running".into()));
            }
            response.await.map_err(|_| {
                StrataError::Internal("provisioner stopped before replying".into())
            })?
        }
        .boxed()
    }
}

/// Create the provisioner root and resolve it to a canonical path.
fn prepare_root(root: &Path) -> StrataResult<PathBuf> {
    std::fs::create_dir_all(root).map_err(|e| {
        StrataError::Storage(format!(
            "failed to create provisioner root directory '{}': {}",
            root.display(),
            e
        ))
    })?;

    std::fs::canonicalize(root).map_err(|e| {
        StrataError::Storage(format!(
            "failed to resolve the realpath of provisioner root directory '{}': {}",
            root.display(),
            e
        ))
    })
}
