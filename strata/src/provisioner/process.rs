//! The provisioning actor.
//!
//! A single task owns the container -> rootfs bookkeeping and handles one
//! request at a time, in arrival order. Bookkeeping is only ever changed
//! synchronously while a request is being handled; anything that waits on
//! the store or a backend runs in a spawned task that answers the caller
//! directly, so the actor keeps accepting requests meanwhile.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use strata_shared::errors::{RootfsFailure, StrataError, StrataResult};
use tokio::sync::{mpsc, oneshot};

use crate::backend::{Backend, BackendRegistry};
use crate::image::{Image, ImageKind};
use crate::paths::{self, ContainerId};
use crate::store::Store;
use crate::util::mount;

/// Rootfses owned by one container: backend -> rootfs id -> rootfs path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Info {
    pub rootfses: BTreeMap<String, BTreeMap<String, PathBuf>>,
}

impl Info {
    /// All `(backend, rootfs)` pairs, in backend order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.rootfses.iter().flat_map(|(backend, rootfses)| {
            rootfses
                .values()
                .map(move |path| (backend.as_str(), path.as_path()))
        })
    }

    pub fn len(&self) -> usize {
        self.rootfses.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) enum ProvisionerRequest {
    Recover {
        live: HashSet<ContainerId>,
        orphans: HashSet<ContainerId>,
        reply: oneshot::Sender<StrataResult<()>>,
    },
    Provision {
        container_id: ContainerId,
        image: Image,
        reply: oneshot::Sender<StrataResult<PathBuf>>,
    },
    Destroy {
        container_id: ContainerId,
        reply: oneshot::Sender<StrataResult<bool>>,
    },
    Containers {
        reply: oneshot::Sender<StrataResult<HashMap<ContainerId, Info>>>,
    },
}

pub(crate) struct ProvisionerProcess {
    /// Canonical provisioner root, `{work_dir}/provisioner/docker`.
    root: PathBuf,
    /// Backend used for new rootfses.
    backend: String,
    bind_mount_rootfs: bool,
    backends: BackendRegistry,
    store: Arc<dyn Store>,
    infos: HashMap<ContainerId, Info>,
}

impl ProvisionerProcess {
    pub(crate) fn new(
        root: PathBuf,
        backend: String,
        bind_mount_rootfs: bool,
        backends: BackendRegistry,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            root,
            backend,
            bind_mount_rootfs,
            backends,
            store,
            infos: HashMap::new(),
        }
    }

    /// Handle requests until every sender is gone.
    pub(crate) async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<ProvisionerRequest>) {
        tracing::debug!(root = %self.root.display(), "Provisioner started");

        while let Some(request) = mailbox.recv().await {
            self.handle(request);
        }

        tracing::debug!(
            containers = self.infos.len(),
            "Provisioner mailbox closed, stopping"
        );
    }

    fn handle(&mut self, request: ProvisionerRequest) {
        match request {
            ProvisionerRequest::Recover {
                live,
                orphans,
                reply,
            } => self.recover(live, orphans, reply),
            ProvisionerRequest::Provision {
                container_id,
                image,
                reply,
            } => self.provision(container_id, image, reply),
            ProvisionerRequest::Destroy {
                container_id,
                reply,
            } => self.destroy(container_id, reply),
            ProvisionerRequest::Containers { reply } => {
                let _ = reply.send(Ok(self.infos.clone()));
            }
        }
    }

    // ========================================================================
    // RECOVER
    // ========================================================================

    fn recover(
        &mut self,
        live: HashSet<ContainerId>,
        orphans: HashSet<ContainerId>,
        reply: oneshot::Sender<StrataResult<()>>,
    ) {
        let (recovered, unknown) = match self.reconcile(&live, &orphans) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Failed to recover provisioner rootfses");
                let _ = reply.send(Err(e));
                return;
            }
        };

        for (container_id, info) in recovered {
            tracing::debug!(
                container_id = %container_id,
                rootfses = info.len(),
                "Recovered container"
            );
            self.infos.insert(container_id, info);
        }
        tracing::info!(
            containers = self.infos.len(),
            unknown_orphans = unknown.len(),
            "Recovered provisioner rootfses"
        );

        let root = self.root.clone();
        let bind_mount_rootfs = self.bind_mount_rootfs;
        let store = Arc::clone(&self.store);
        let cleanups: Vec<_> = unknown
            .into_iter()
            .map(|(container_id, rootfses)| {
                cleanup_orphan(root.clone(), container_id, rootfses, bind_mount_rootfs)
            })
            .collect();

        tokio::spawn(async move {
            join_all(cleanups).await;

            let result = store.recover().await;
            match &result {
                Ok(()) => tracing::info!("Recovered image store"),
                Err(e) => tracing::error!(error = %e, "Failed to recover image store"),
            }
            let _ = reply.send(result);
        });
    }

    /// Scan the root and split containers into recovered and unknown.
    ///
    /// Every container is validated before anything is returned, so an
    /// unregistered backend anywhere fails recovery without side effects.
    #[allow(clippy::type_complexity)]
    fn reconcile(
        &self,
        live: &HashSet<ContainerId>,
        orphans: &HashSet<ContainerId>,
    ) -> StrataResult<(
        Vec<(ContainerId, Info)>,
        Vec<(ContainerId, Vec<(Arc<dyn Backend>, PathBuf)>)>,
    )> {
        let containers = paths::list_containers(&self.root).map_err(|e| {
            StrataError::Storage(format!(
                "failed to list the containers managed by the provisioner: {}",
                e
            ))
        })?;

        let mut recovered = Vec::new();
        let mut unknown = Vec::new();

        for container_id in containers.into_keys() {
            let rootfses = paths::list_container_rootfses(&self.root, &container_id)
                .map_err(|e| {
                    StrataError::Storage(format!(
                        "unable to list rootfses of container '{}': {}",
                        container_id, e
                    ))
                })?;

            for backend in rootfses.keys() {
                if !self.backends.contains(backend) {
                    return Err(StrataError::unknown_backend(
                        backend.clone(),
                        format!(
                            "found rootfses of container '{}' managed by an unrecognized backend",
                            container_id
                        ),
                    ));
                }
            }

            if live.contains(&container_id) || orphans.contains(&container_id) {
                // Known orphans are recovered too; the caller destroys them
                // through the normal destroy path.
                recovered.push((container_id, Info { rootfses }));
                continue;
            }

            let mut targets = Vec::new();
            for (backend, by_id) in rootfses {
                if let Some(backend) = self.backends.get(&backend) {
                    targets.extend(by_id.into_values().map(|path| (Arc::clone(backend), path)));
                }
            }
            unknown.push((container_id, targets));
        }

        Ok((recovered, unknown))
    }

    // ========================================================================
    // PROVISION
    // ========================================================================

    fn provision(
        &mut self,
        container_id: ContainerId,
        image: Image,
        reply: oneshot::Sender<StrataResult<PathBuf>>,
    ) {
        if image.kind != ImageKind::Docker {
            let _ = reply.send(Err(StrataError::InvalidArgument(format!(
                "unsupported container image type '{}'",
                image.kind
            ))));
            return;
        }

        let Some(docker) = image.docker else {
            let _ = reply.send(Err(StrataError::InvalidArgument(
                "missing docker image info".into(),
            )));
            return;
        };

        let Some(backend) = self.backends.get(&self.backend).cloned() else {
            let _ = reply.send(Err(StrataError::Config(format!(
                "backend '{}' is not available",
                self.backend
            ))));
            return;
        };

        let rootfs_id = uuid::Uuid::new_v4().to_string();
        let rootfs = paths::container_rootfs(&self.root, &container_id, &self.backend, &rootfs_id);

        // Reserve the path before any async work so a racing destroy sees it.
        self.infos
            .entry(container_id.clone())
            .or_default()
            .rootfses
            .entry(self.backend.clone())
            .or_default()
            .insert(rootfs_id.clone(), rootfs.clone());

        tracing::info!(
            container_id = %container_id,
            image = %docker.name,
            backend = %self.backend,
            rootfs = %rootfs.display(),
            "Provisioning rootfs"
        );

        let store = Arc::clone(&self.store);
        let bind_mount_rootfs = self.bind_mount_rootfs;

        tokio::spawn(async move {
            let result =
                assemble_rootfs(store, backend, &docker.name, rootfs, bind_mount_rootfs).await;
            if let Err(e) = &result {
                tracing::warn!(
                    container_id = %container_id,
                    rootfs_id = %rootfs_id,
                    error = %e,
                    "Failed to provision rootfs"
                );
            }
            let _ = reply.send(result);
        });
    }

    // ========================================================================
    // DESTROY
    // ========================================================================

    fn destroy(&mut self, container_id: ContainerId, reply: oneshot::Sender<StrataResult<bool>>) {
        let Some(info) = self.infos.remove(&container_id) else {
            tracing::info!(
                container_id = %container_id,
                "Ignoring destroy request for unknown container"
            );
            let _ = reply.send(Ok(false));
            return;
        };

        let mut targets = Vec::with_capacity(info.len());
        for (backend_name, rootfs) in info.entries() {
            match self.backends.get(backend_name) {
                Some(backend) => targets.push((Arc::clone(backend), rootfs.to_path_buf())),
                None => {
                    let e = StrataError::unknown_backend(
                        backend_name,
                        format!(
                            "cannot destroy rootfs '{}' of container '{}'",
                            rootfs.display(),
                            container_id
                        ),
                    );
                    tracing::error!(
                        container_id = %container_id,
                        error = %e,
                        "Failed to destroy container"
                    );
                    let _ = reply.send(Err(e));
                    return;
                }
            }
        }

        tracing::info!(
            container_id = %container_id,
            rootfses = targets.len(),
            "Destroying container rootfses"
        );

        let root = self.root.clone();
        let bind_mount_rootfs = self.bind_mount_rootfs;

        tokio::spawn(async move {
            let failures = destroy_all(&targets, bind_mount_rootfs).await;
            let result = if failures.is_empty() {
                remove_container_dir(root, container_id.clone())
                    .await
                    .map(|()| true)
            } else {
                Err(StrataError::Destroy {
                    container_id: container_id.to_string(),
                    failures,
                })
            };

            match &result {
                Ok(_) => {
                    tracing::info!(container_id = %container_id, "Destroyed container rootfses")
                }
                Err(e) => tracing::warn!(
                    container_id = %container_id,
                    error = %e,
                    "Failed to destroy container"
                ),
            }
            let _ = reply.send(result);
        });
    }
}

// ============================================================================
// ASYNC STEPS (run outside the actor)
// ============================================================================

/// Resolve the image, have the backend assemble it, then pin the rootfs.
async fn assemble_rootfs(
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    image_name: &str,
    rootfs: PathBuf,
    bind_mount_rootfs: bool,
) -> StrataResult<PathBuf> {
    let image = store.get(image_name).await?;

    let layers: Vec<PathBuf> = image
        .layers
        .iter()
        .map(|layer| store.layer_path(layer))
        .collect();

    tracing::debug!(
        image = %image.name,
        layers = layers.len(),
        backend = backend.name(),
        "Resolved image, assembling rootfs"
    );
    backend.provision(&layers, &rootfs).await?;

    if bind_mount_rootfs {
        // Later mounts placed under the rootfs by the caller must be carried
        // along when the container pivots into it.
        let target = rootfs.clone();
        tokio::task::spawn_blocking(move || mount::bind_mount_self(&target))
            .await
            .map_err(|e| StrataError::Internal(format!("mount task failed: {}", e)))??;
    }

    Ok(rootfs)
}

/// Destroy every `(backend, rootfs)` pair concurrently and collect failures.
async fn destroy_all(
    targets: &[(Arc<dyn Backend>, PathBuf)],
    bind_mount_rootfs: bool,
) -> Vec<RootfsFailure> {
    let results = join_all(targets.iter().map(|(backend, rootfs)| {
        destroy_rootfs(Arc::clone(backend), rootfs.clone(), bind_mount_rootfs)
    }))
    .await;

    targets
        .iter()
        .zip(results)
        .filter_map(|((backend, rootfs), result)| {
            result.err().map(|e| RootfsFailure {
                backend: backend.name().to_string(),
                rootfs: rootfs.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

async fn destroy_rootfs(
    backend: Arc<dyn Backend>,
    rootfs: PathBuf,
    bind_mount_rootfs: bool,
) -> StrataResult<bool> {
    if bind_mount_rootfs {
        let target = rootfs.clone();
        tokio::task::spawn_blocking(move || mount::unmount(&target))
            .await
            .map_err(|e| StrataError::Internal(format!("unmount task failed: {}", e)))??;
    }

    let removed = backend.destroy(&rootfs).await?;
    tracing::debug!(
        backend = backend.name(),
        rootfs = %rootfs.display(),
        removed,
        "Destroyed rootfs"
    );
    Ok(removed)
}

async fn remove_container_dir(root: PathBuf, container_id: ContainerId) -> StrataResult<()> {
    tokio::task::spawn_blocking(move || paths::remove_container_dir(&root, &container_id))
        .await
        .map_err(|e| StrataError::Internal(format!("cleanup task failed: {}", e)))?
}

/// Best-effort destruction of a container nobody claimed. Never fails.
async fn cleanup_orphan(
    root: PathBuf,
    container_id: ContainerId,
    targets: Vec<(Arc<dyn Backend>, PathBuf)>,
    bind_mount_rootfs: bool,
) {
    for (_, rootfs) in &targets {
        tracing::debug!(
            container_id = %container_id,
            rootfs = %rootfs.display(),
            "Destroying orphan rootfs"
        );
    }

    let failures = destroy_all(&targets, bind_mount_rootfs).await;
    if !failures.is_empty() {
        for failure in &failures {
            tracing::warn!(
                container_id = %container_id,
                "Failed to destroy orphan rootfs {}",
                failure
            );
        }
        return;
    }

    if let Err(e) = remove_container_dir(root, container_id.clone()).await {
        tracing::warn!(
            container_id = %container_id,
            error = %e,
            "Failed to remove orphan container directory"
        );
    }
}
