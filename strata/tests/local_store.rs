//! End-to-end: the local image store feeding the copy backend.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata::{
    BackendRegistry, ContainerId, Image, LocalStore, Provisioner, ProvisionerOptions,
    StrataError,
};
use tempfile::TempDir;

fn options(work_dir: &Path) -> ProvisionerOptions {
    ProvisionerOptions {
        work_dir: work_dir.to_path_buf(),
        backend: "copy".to_string(),
        store_dir: None,
        bind_mount_rootfs: false,
        log_to_file: false,
        copy_xattrs: true,
        ignore_chown_errors: true,
    }
}

fn layer(root: &Path, id: &str, files: &[(&str, &str)]) -> (String, PathBuf) {
    let dir = root.join("sources").join(id);
    for (path, contents) in files {
        let path = dir.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    fs::create_dir_all(&dir).unwrap();
    (id.to_string(), dir)
}

#[tokio::test]
async fn test_provision_from_local_store_with_copy_backend() {
    let temp = TempDir::new().unwrap();
    let options = options(&temp.path().join("work"));

    let store = LocalStore::new(options.store_dir()).unwrap();
    store
        .import(
            "library/nginx:1.9",
            vec![
                layer(
                    temp.path(),
                    "base",
                    &[("etc/hostname", "base"), ("etc/shadow", "secret"), ("bin/sh", "sh")],
                ),
                layer(
                    temp.path(),
                    "app",
                    &[("etc/hostname", "app"), ("etc/.wh.shadow", "")],
                ),
            ],
        )
        .await
        .unwrap();

    let registry = BackendRegistry::from_options(&options.backend_options());
    let provisioner =
        Provisioner::with_components(options, Arc::new(store), registry).unwrap();
    provisioner
        .recover(HashSet::new(), HashSet::new())
        .await
        .unwrap();

    let container = ContainerId::new("c1").unwrap();
    let rootfs = provisioner
        .provision(container.clone(), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "app");
    assert_eq!(fs::read_to_string(rootfs.join("bin/sh")).unwrap(), "sh");
    assert!(!rootfs.join("etc/shadow").exists());
    assert!(!rootfs.join("etc/.wh.shadow").exists());

    // The rootfs is a private copy; writing to it leaves the store alone.
    fs::write(rootfs.join("etc/hostname"), "changed").unwrap();
    let second = provisioner
        .provision(ContainerId::new("c2").unwrap(), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(second.join("etc/hostname")).unwrap(), "app");

    assert!(provisioner.destroy(container).await.unwrap());
    assert!(!rootfs.exists());
    assert!(second.is_dir());
}

#[tokio::test]
async fn test_create_with_default_collaborators() {
    let temp = TempDir::new().unwrap();
    let provisioner = Provisioner::create(options(&temp.path().join("work"))).unwrap();
    assert_eq!(provisioner.backend(), "copy");

    provisioner
        .recover(HashSet::new(), HashSet::new())
        .await
        .unwrap();

    let err = provisioner
        .provision(ContainerId::new("c1").unwrap(), Image::docker("missing:1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::Image(_)));

    provisioner.shutdown().await.unwrap();
}
