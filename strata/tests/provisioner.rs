//! Provision / destroy behaviour of the provisioner actor.

use std::collections::HashSet;

use futures::future::join_all;
use strata::image::ImageKind;
use strata::{BackendRegistry, ContainerId, Image, Provisioner, StrataError, Store};
use strata_test_utils::{FAKE_BACKEND, TestContext};

fn cid(value: &str) -> ContainerId {
    ContainerId::new(value).unwrap()
}

#[tokio::test]
async fn test_provision_builds_rootfs_under_container() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    let rootfs = provisioner
        .provision(cid("c1"), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();

    let backend_dir = provisioner
        .root()
        .join("containers")
        .join("c1")
        .join(FAKE_BACKEND);
    assert_eq!(rootfs.parent().unwrap().parent().unwrap(), backend_dir);
    assert_eq!(rootfs.file_name().unwrap(), "rootfs");
    assert!(rootfs.is_dir());

    let provisions = ctx.backend.provisions();
    assert_eq!(provisions.len(), 1);
    assert_eq!(
        provisions[0].0,
        vec![ctx.store.layer_path("L1"), ctx.store.layer_path("L2")]
    );
    assert_eq!(provisions[0].1, rootfs);

    let containers = provisioner.containers().await.unwrap();
    let info = &containers[&cid("c1")];
    assert_eq!(info.len(), 1);
    assert_eq!(info.entries().next(), Some((FAKE_BACKEND, rootfs.as_path())));
}

#[tokio::test]
async fn test_provision_normalises_image_name() {
    let ctx = TestContext::new();
    ctx.store.add_image("busybox", &["B1"]);
    let provisioner = ctx.provisioner().unwrap();

    provisioner
        .provision(cid("c1"), Image::docker("busybox:latest"))
        .await
        .unwrap();

    assert_eq!(ctx.backend.provisions()[0].0, vec![ctx.store.layer_path("B1")]);
}

#[tokio::test]
async fn test_repeated_provisions_get_distinct_rootfses() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    let requests: Vec<_> = (0..8)
        .map(|_| provisioner.provision(cid("c1"), Image::docker("library/nginx:1.9")))
        .collect();
    let rootfses: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let unique: HashSet<_> = rootfses.iter().collect();
    assert_eq!(unique.len(), 8);

    let containers = provisioner.containers().await.unwrap();
    assert_eq!(containers[&cid("c1")].len(), 8);
}

#[tokio::test]
async fn test_destroy_removes_every_rootfs() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    let first = provisioner
        .provision(cid("c1"), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();
    let second = provisioner
        .provision(cid("c1"), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();

    assert!(provisioner.destroy(cid("c1")).await.unwrap());
    assert!(!first.exists());
    assert!(!second.exists());
    assert!(!provisioner.root().join("containers").join("c1").exists());

    let mut destroyed = ctx.backend.destroys();
    destroyed.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(destroyed, expected);

    assert!(!provisioner.destroy(cid("c1")).await.unwrap());
    assert!(provisioner.containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_unknown_container_is_noop() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    assert!(!provisioner.destroy(cid("ghost")).await.unwrap());
    assert!(ctx.backend.destroys().is_empty());
}

#[tokio::test]
async fn test_destroy_leaves_other_containers_alone() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    provisioner
        .provision(cid("c1"), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();
    let kept = provisioner
        .provision(cid("c2"), Image::docker("library/nginx:1.9"))
        .await
        .unwrap();

    assert!(provisioner.destroy(cid("c1")).await.unwrap());

    assert!(kept.is_dir());
    let containers = provisioner.containers().await.unwrap();
    assert_eq!(containers.len(), 1);
    assert!(containers.contains_key(&cid("c2")));
}

#[tokio::test]
async fn test_destroy_sees_provision_still_in_flight() {
    let ctx = TestContext::gated();
    let provisioner = ctx.provisioner().unwrap();

    let provision = provisioner.provision(cid("c1"), Image::docker("library/nginx:1.9"));
    let destroy = provisioner.destroy(cid("c1"));

    // The image lookup is still blocked, yet the rootfs is already tracked.
    assert!(destroy.await.unwrap());
    assert_eq!(ctx.backend.destroys().len(), 1);
    assert!(provisioner.containers().await.unwrap().is_empty());

    ctx.store.open_gate();
    let rootfs = provision.await.unwrap();
    assert_eq!(ctx.backend.destroys()[0], rootfs);
}

#[tokio::test]
async fn test_destroy_reports_every_failure() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    for _ in 0..2 {
        provisioner
            .provision(cid("c1"), Image::docker("library/nginx:1.9"))
            .await
            .unwrap();
    }

    ctx.backend.fail_destroy(true);
    let err = provisioner.destroy(cid("c1")).await.unwrap_err();
    match err {
        StrataError::Destroy {
            container_id,
            failures,
        } => {
            assert_eq!(container_id, "c1");
            assert_eq!(failures.len(), 2);
            assert!(failures.iter().all(|f| f.backend == FAKE_BACKEND));
            assert!(failures.iter().all(|f| f.message.contains("injected")));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Bookkeeping is gone; the directory is left for the next recovery.
    assert!(provisioner.containers().await.unwrap().is_empty());
    assert!(provisioner.root().join("containers").join("c1").exists());
    assert!(!provisioner.destroy(cid("c1")).await.unwrap());
}

#[tokio::test]
async fn test_provision_rejects_unsupported_images() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    let err = provisioner
        .provision(cid("c1"), Image::appc("example.com/app"))
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::InvalidArgument(_)));

    let missing = Image {
        kind: ImageKind::Docker,
        docker: None,
        appc: None,
    };
    let err = provisioner.provision(cid("c1"), missing).await.unwrap_err();
    assert!(matches!(err, StrataError::InvalidArgument(_)));

    assert!(provisioner.containers().await.unwrap().is_empty());
    assert!(ctx.backend.provisions().is_empty());
    assert_eq!(ctx.store.get_calls(), 0);
}

#[tokio::test]
async fn test_failed_provision_stays_tracked_until_destroy() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    let err = provisioner
        .provision(cid("c1"), Image::docker("unknown/image:1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::Image(_)));
    assert!(ctx.backend.provisions().is_empty());

    ctx.backend.fail_provision(true);
    let err = provisioner
        .provision(cid("c1"), Image::docker("library/nginx:1.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::Backend { .. }));

    let containers = provisioner.containers().await.unwrap();
    assert_eq!(containers[&cid("c1")].len(), 2);

    assert!(provisioner.destroy(cid("c1")).await.unwrap());
    assert!(provisioner.containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_second_provisioner_on_same_root_fails() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    let err = ctx.provisioner().unwrap_err();
    assert!(matches!(err, StrataError::Internal(_)));

    provisioner.shutdown().await.unwrap();
    let again = ctx.provisioner().unwrap();
    again.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_create_rejects_unusable_backend_configuration() {
    let ctx = TestContext::new();

    let mut options = ctx.options();
    options.backend = "zfs".to_string();
    let err =
        Provisioner::with_components(options, ctx.store.clone(), ctx.registry()).unwrap_err();
    assert!(matches!(err, StrataError::Config(_)));

    let err = Provisioner::with_components(
        ctx.options(),
        ctx.store.clone(),
        BackendRegistry::default(),
    )
    .unwrap_err();
    assert!(matches!(err, StrataError::Config(_)));

    let mut options = ctx.options();
    options.work_dir = "relative/work".into();
    let err =
        Provisioner::with_components(options, ctx.store.clone(), ctx.registry()).unwrap_err();
    assert!(matches!(err, StrataError::Config(_)));
}

#[tokio::test]
async fn test_shutdown_answers_queued_requests() {
    let ctx = TestContext::new();
    let provisioner = ctx.provisioner().unwrap();

    let pending = provisioner.provision(cid("c1"), Image::docker("library/nginx:1.9"));
    provisioner.shutdown().await.unwrap();

    // Already queued requests are still answered.
    assert!(pending.await.unwrap().is_dir());
}
