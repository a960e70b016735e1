//! Mount primitives used by the provisioner and the mount-based backends.
//!
//! All of these need CAP_SYS_ADMIN and are only implemented on Linux;
//! elsewhere they fail with `StrataError::Mount`.

use std::path::{Path, PathBuf};

use strata_shared::errors::{StrataError, StrataResult};

/// Bind mount `rootfs` onto itself and mark it shared.
///
/// Done once the rootfs is assembled so that mounts the caller layers on
/// top afterwards are carried along when the container pivots into it.
#[cfg(target_os = "linux")]
pub fn bind_mount_self(rootfs: &Path) -> StrataResult<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        StrataError::Mount(format!(
            "failed to bind mount rootfs {}: {}",
            rootfs.display(),
            e
        ))
    })?;

    mount(
        None::<&str>,
        rootfs,
        None::<&str>,
        MsFlags::MS_SHARED,
        None::<&str>,
    )
    .map_err(|e| {
        StrataError::Mount(format!(
            "failed to make rootfs {} shared: {}",
            rootfs.display(),
            e
        ))
    })?;

    tracing::debug!(rootfs = %rootfs.display(), "Bind mounted rootfs onto itself");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount_self(rootfs: &Path) -> StrataResult<()> {
    Err(StrataError::Mount(format!(
        "bind mounts are not supported on this platform: {}",
        rootfs.display()
    )))
}

/// Bind mount `source` read-only at `target`.
#[cfg(target_os = "linux")]
pub fn bind_mount_readonly(source: &Path, target: &Path) -> StrataResult<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        StrataError::Mount(format!(
            "failed to bind mount {} at {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    // MS_RDONLY is ignored on the initial bind; it only sticks on remount.
    if let Err(e) = mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    ) {
        let _ = unmount(target);
        return Err(StrataError::Mount(format!(
            "failed to remount {} read-only: {}",
            target.display(),
            e
        )));
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount_readonly(source: &Path, target: &Path) -> StrataResult<()> {
    Err(StrataError::Mount(format!(
        "bind mounts are not supported on this platform: {} -> {}",
        source.display(),
        target.display()
    )))
}

/// Mount overlayfs at `target`.
///
/// `lower_dirs` are given base layer first and are reversed here, since
/// overlayfs expects the topmost lower directory first.
#[cfg(target_os = "linux")]
pub fn mount_overlay(
    lower_dirs: &[PathBuf],
    upper_dir: &Path,
    work_dir: &Path,
    target: &Path,
) -> StrataResult<()> {
    use nix::mount::{MsFlags, mount};

    if lower_dirs.is_empty() {
        return Err(StrataError::Mount(
            "Cannot mount overlayfs with no lower directories".into(),
        ));
    }

    let options = overlay_options(lower_dirs, upper_dir, work_dir);
    tracing::debug!("Mounting overlayfs with options: {}", options);

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| {
        StrataError::Mount(format!(
            "failed to mount overlayfs at {}: {}",
            target.display(),
            e
        ))
    })?;

    tracing::info!("Overlayfs mounted at {}", target.display());
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(
    _lower_dirs: &[PathBuf],
    _upper_dir: &Path,
    _work_dir: &Path,
    target: &Path,
) -> StrataResult<()> {
    Err(StrataError::Mount(format!(
        "overlayfs is not supported on this platform: {}",
        target.display()
    )))
}

pub(crate) fn overlay_options(lower_dirs: &[PathBuf], upper_dir: &Path, work_dir: &Path) -> String {
    let lowerdir = lower_dirs
        .iter()
        .rev()
        .map(|p| p.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(":");

    format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper_dir.display(),
        work_dir.display()
    )
}

/// Lazily unmount `target`.
///
/// Returns `Ok(false)` when `target` is missing or not a mount point.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> StrataResult<bool> {
    use nix::errno::Errno;
    use nix::mount::{MntFlags, umount2};

    // umount2 needs CAP_SYS_ADMIN even to report "not mounted"
    if !is_mount_point(target)? {
        return Ok(false);
    }

    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!("Unmounted {}", target.display());
            Ok(true)
        }
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(StrataError::Mount(format!(
            "failed to unmount {}: {}",
            target.display(),
            e
        ))),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> StrataResult<bool> {
    Ok(false) // Nothing is ever mounted on non-Linux platforms
}

/// Whether `path` is currently a mount point in this mount namespace.
///
/// Missing paths are not mount points.
#[cfg(target_os = "linux")]
pub fn is_mount_point(path: &Path) -> StrataResult<bool> {
    let path = match std::fs::canonicalize(path) {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(StrataError::Mount(format!(
                "failed to resolve {}: {}",
                path.display(),
                e
            )));
        }
    };

    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| StrataError::Mount(format!("failed to read mountinfo: {}", e)))?;

    Ok(mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| Path::new(&unescape_mountinfo(mount_point)) == path))
}

#[cfg(not(target_os = "linux"))]
pub fn is_mount_point(_path: &Path) -> StrataResult<bool> {
    Ok(false)
}

/// Decode the octal escapes (`\040` for space) mountinfo uses in paths.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'\\'
            && idx + 3 < bytes.len()
            && bytes[idx + 1..idx + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[idx + 1..idx + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                idx += 4;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
