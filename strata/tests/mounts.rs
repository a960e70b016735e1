//! Mount-backed rootfses: the self bind mount, overlay and bind backends.
//!
//! These need CAP_SYS_ADMIN and return early when run unprivileged.

use std::fs;
use std::path::{Path, PathBuf};

use strata::backend::{BindBackend, OverlayBackend};
use strata::util::mount::is_mount_point;
use strata::{Backend, ContainerId, Image, Provisioner};
use strata_test_utils::TestContext;
use tempfile::TempDir;

fn privileged() -> bool {
    if cfg!(target_os = "linux") && nix::unistd::geteuid().is_root() {
        return true;
    }
    eprintln!("skipping: mounts need root");
    false
}

fn layer(root: &Path, id: &str, files: &[(&str, &str)]) -> PathBuf {
    let dir = root.join("layers").join(id);
    fs::create_dir_all(&dir).unwrap();
    for (path, contents) in files {
        let path = dir.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_rootfs_self_bind_mount_lifecycle() {
    if !privileged() {
        return;
    }

    let ctx = TestContext::new();
    let mut options = ctx.options();
    options.bind_mount_rootfs = true;
    let provisioner =
        Provisioner::with_components(options, ctx.store.clone(), ctx.registry()).unwrap();

    let container = ContainerId::new("c1").unwrap();
    let rootfs = provisioner
        .provision(container.clone(), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();
    assert!(is_mount_point(&rootfs).unwrap());
    assert!(rootfs.join("layers").is_file());

    assert!(provisioner.destroy(container).await.unwrap());
    assert!(!is_mount_point(&rootfs).unwrap());
    assert!(!rootfs.exists());
}

#[tokio::test]
async fn test_overlay_backend_lifecycle() {
    if !privileged() {
        return;
    }
    let Ok(backend) = OverlayBackend::detect() else {
        eprintln!("skipping: overlayfs unavailable");
        return;
    };

    let temp = TempDir::new().unwrap();
    let base = layer(temp.path(), "base", &[("etc/hostname", "base"), ("bin/sh", "sh")]);
    let top = layer(temp.path(), "top", &[("etc/hostname", "top")]);
    let rootfs = temp.path().join("containers/c1/overlay/id/rootfs");

    backend.provision(&[base.clone(), top], &rootfs).await.unwrap();
    assert!(is_mount_point(&rootfs).unwrap());
    assert_eq!(fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "top");
    assert_eq!(fs::read_to_string(rootfs.join("bin/sh")).unwrap(), "sh");

    // Writes land in the upper dir, never in a layer.
    let upper = rootfs.parent().unwrap().join("upper");
    let work = rootfs.parent().unwrap().join("work");
    fs::write(rootfs.join("etc/hostname"), "changed").unwrap();
    assert_eq!(fs::read_to_string(upper.join("etc/hostname")).unwrap(), "changed");
    assert_eq!(fs::read_to_string(base.join("etc/hostname")).unwrap(), "base");

    // Provisioning the same rootfs again keeps the existing mount.
    backend.provision(&[base.clone()], &rootfs).await.unwrap();
    assert_eq!(fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "changed");

    assert!(backend.destroy(&rootfs).await.unwrap());
    assert!(!is_mount_point(&rootfs).unwrap());
    assert!(!rootfs.exists());
    assert!(!upper.exists());
    assert!(!work.exists());
    assert!(base.join("bin/sh").is_file());

    assert!(!backend.destroy(&rootfs).await.unwrap());
}

#[tokio::test]
async fn test_bind_backend_lifecycle() {
    if !privileged() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let image = layer(temp.path(), "only", &[("etc/hostname", "bound")]);
    let rootfs = temp.path().join("containers/c1/bind/id/rootfs");
    let backend = BindBackend::new();

    backend.provision(&[image.clone()], &rootfs).await.unwrap();
    assert!(is_mount_point(&rootfs).unwrap());
    assert_eq!(fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "bound");

    // Read-only even for root.
    assert!(fs::write(rootfs.join("etc/hostname"), "changed").is_err());

    assert!(backend.destroy(&rootfs).await.unwrap());
    assert!(!is_mount_point(&rootfs).unwrap());
    assert!(!rootfs.exists());
    assert_eq!(fs::read_to_string(image.join("etc/hostname")).unwrap(), "bound");
}
