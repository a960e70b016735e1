//! Directory copy helpers for the copy backend, modelled on a VFS storage driver.
//!
//! A rootfs is assembled by copying the base layer into place and then
//! overlaying each later layer on top. Overlaying applies OCI whiteouts:
//! - `.wh.<name>` removes `<name>` from the rootfs
//! - `.wh..wh..opq` clears the directory it sits in before the layer is copied
//!
//! Whiteouts are resolved without following symlinks, so a link left by an
//! earlier layer can never redirect a removal outside the rootfs.
//!
//! Copies never follow symlinks and preserve permissions, ownership,
//! timestamps and a subset of xattrs. Hardlinks within one layer stay linked.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, symlink};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use strata_shared::errors::{StrataError, StrataResult};
use walkdir::WalkDir;

#[cfg(target_os = "linux")]
use std::os::unix::fs::FileTypeExt;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// File identifier for hardlink detection (device + inode)
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
struct FileId {
    dev: u64,
    ino: u64,
}

/// Options for copying a layer into a rootfs
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    /// Whether to copy xattrs
    pub copy_xattrs: bool,
    /// Ignore ownership errors (unprivileged provisioners)
    pub ignore_chown_errors: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            copy_xattrs: true,
            ignore_chown_errors: true,
        }
    }
}

/// Assemble `rootfs` from `layers`, base layer first.
///
/// The rootfs directory is created if missing. Re-running against an
/// already assembled rootfs overwrites it layer by layer.
pub fn assemble(layers: &[PathBuf], rootfs: &Path, options: CopyOptions) -> StrataResult<()> {
    if layers.is_empty() {
        return Err(StrataError::Storage(
            "Cannot assemble rootfs with no layers".into(),
        ));
    }

    for layer in layers {
        if !layer.is_dir() {
            return Err(StrataError::Storage(format!(
                "Layer directory does not exist: {}",
                layer.display()
            )));
        }
    }

    fs::create_dir_all(rootfs).map_err(|e| {
        StrataError::Storage(format!(
            "Failed to create rootfs directory {}: {}",
            rootfs.display(),
            e
        ))
    })?;

    for (idx, layer) in layers.iter().enumerate() {
        tracing::debug!(
            "Copying layer {}/{}: {} -> {}",
            idx + 1,
            layers.len(),
            layer.display(),
            rootfs.display()
        );
        overlay_layer(layer, rootfs, options)?;
    }

    Ok(())
}

/// Copy `layer` on top of `dst`, applying whiteouts first.
pub fn overlay_layer(layer: &Path, dst: &Path, options: CopyOptions) -> StrataResult<()> {
    apply_whiteouts(layer, dst)?;
    dir_copy(layer, dst, options, Markers::Drop)
}

/// Copy a single layer verbatim into `dst`, whiteout markers included.
///
/// Used to store layers; the markers are only interpreted when a rootfs
/// is assembled from them.
pub fn copy_layer(layer: &Path, dst: &Path, options: CopyOptions) -> StrataResult<()> {
    if !layer.is_dir() {
        return Err(StrataError::Storage(format!(
            "Layer directory does not exist: {}",
            layer.display()
        )));
    }

    fs::create_dir_all(dst).map_err(|e| {
        StrataError::Storage(format!(
            "Failed to create layer directory {}: {}",
            dst.display(),
            e
        ))
    })?;

    dir_copy(layer, dst, options, Markers::Keep)
}

/// What `dir_copy` does with whiteout marker files.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Markers {
    Keep,
    Drop,
}

/// Delete everything the whiteout markers in `layer` hide from `dst`.
fn apply_whiteouts(layer: &Path, dst: &Path) -> StrataResult<()> {
    for entry in WalkDir::new(layer).follow_links(false) {
        let entry = entry.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to walk layer directory {}: {}",
                layer.display(),
                e
            ))
        })?;

        let file_name = entry.file_name().to_string_lossy();
        let Some(target_name) = whiteout_target(&file_name) else {
            continue;
        };

        let rel_parent = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(layer).ok())
            .unwrap_or(Path::new(""));
        let Some(dst_parent) = resolve_dir(dst, rel_parent)? else {
            // A missing directory or a non-directory (symlink included) in
            // the way: nothing below it exists in the rootfs.
            tracing::trace!("Whiteout {} has nothing to hide", entry.path().display());
            continue;
        };

        match target_name {
            Whiteout::Opaque => {
                clear_dir(&dst_parent)?;
                tracing::trace!("Opaque: cleared {}", dst_parent.display());
            }
            Whiteout::Entry(name) if name == "." || name == ".." => {
                tracing::warn!("Ignoring malformed whiteout {}", entry.path().display());
            }
            Whiteout::Entry(name) => {
                let target = dst_parent.join(name);
                remove_path(&target)?;
                tracing::trace!("Whiteout: removed {}", target.display());
            }
        }
    }

    Ok(())
}

enum Whiteout<'a> {
    Opaque,
    Entry(&'a str),
}

fn whiteout_target(file_name: &str) -> Option<Whiteout<'_>> {
    if file_name == OPAQUE_MARKER {
        return Some(Whiteout::Opaque);
    }
    file_name
        .strip_prefix(WHITEOUT_PREFIX)
        .filter(|name| !name.is_empty())
        .map(Whiteout::Entry)
}

/// Resolve `rel` under `root` without following symlinks.
///
/// Returns `None` unless every component is an existing real directory.
fn resolve_dir(root: &Path, rel: &Path) -> StrataResult<Option<PathBuf>> {
    let mut current = root.to_path_buf();

    for component in rel.components() {
        let Component::Normal(name) = component else {
            return Ok(None);
        };
        current.push(name);

        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StrataError::Storage(format!(
                    "Failed to stat {}: {}",
                    current.display(),
                    e
                )));
            }
        }
    }

    Ok(Some(current))
}

/// Remove the contents of `dir`, keeping the directory itself.
fn clear_dir(dir: &Path) -> StrataResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(StrataError::Storage(format!(
                "Failed to read opaque dir {}: {}",
                dir.display(),
                e
            )));
        }
    };

    for entry in entries {
        let entry = entry.map_err(|e| {
            StrataError::Storage(format!("Failed to read entry in {}: {}", dir.display(), e))
        })?;
        remove_path(&entry.path())?;
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are ignored.
pub(crate) fn remove_path(path: &Path) -> StrataResult<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(StrataError::Storage(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            )));
        }
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::Storage(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Recursively copy `src_dir` into `dst_dir`, merging with existing content.
///
/// Directory modes and timestamps are applied after their children are
/// written, deepest first, so read-only directories in a layer do not block
/// the copy.
fn dir_copy(
    src_dir: &Path,
    dst_dir: &Path,
    options: CopyOptions,
    markers: Markers,
) -> StrataResult<()> {
    let mut copied_files: HashMap<FileId, PathBuf> = HashMap::new();
    let mut dirs_to_finish: Vec<(PathBuf, PathBuf, fs::Metadata)> = Vec::new();

    for entry in WalkDir::new(src_dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            StrataError::Storage(format!(
                "Failed to walk directory {}: {}",
                src_dir.display(),
                e
            ))
        })?;

        if markers == Markers::Drop
            && whiteout_target(entry.file_name().to_string_lossy().as_ref()).is_some()
        {
            continue;
        }

        let src_path = entry.path();
        let rel_path = src_path.strip_prefix(src_dir).map_err(|e| {
            StrataError::Storage(format!(
                "Failed to rebase path {}: {}",
                src_path.display(),
                e
            ))
        })?;
        let dst_path = dst_dir.join(rel_path);

        let metadata = fs::symlink_metadata(src_path).map_err(|e| {
            StrataError::Storage(format!("Failed to stat {}: {}", src_path.display(), e))
        })?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            match fs::symlink_metadata(&dst_path) {
                Ok(existing) if existing.is_dir() => {}
                Ok(_) => {
                    remove_path(&dst_path)?;
                    create_dir(&dst_path)?;
                }
                Err(_) => create_dir(&dst_path)?,
            }
            dirs_to_finish.push((src_path.to_path_buf(), dst_path, metadata));
            continue;
        }

        // A later layer replaces whatever an earlier one left at this path.
        remove_path(&dst_path)?;

        if file_type.is_file() {
            let file_id = FileId {
                dev: metadata.dev(),
                ino: metadata.ino(),
            };

            if let Some(existing_dst) = copied_files.get(&file_id) {
                fs::hard_link(existing_dst, &dst_path).map_err(|e| {
                    StrataError::Storage(format!(
                        "Failed to create hardlink {} -> {}: {}",
                        existing_dst.display(),
                        dst_path.display(),
                        e
                    ))
                })?;
                continue;
            }

            fs::copy(src_path, &dst_path).map_err(|e| {
                StrataError::Storage(format!(
                    "Failed to copy file {} -> {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
            copied_files.insert(file_id, dst_path.clone());
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(src_path).map_err(|e| {
                StrataError::Storage(format!(
                    "Failed to read symlink {}: {}",
                    src_path.display(),
                    e
                ))
            })?;

            symlink(&link_target, &dst_path).map_err(|e| {
                StrataError::Storage(format!(
                    "Failed to create symlink {} -> {}: {}",
                    dst_path.display(),
                    link_target.display(),
                    e
                ))
            })?;
        } else {
            #[cfg(target_os = "linux")]
            {
                if file_type.is_fifo() {
                    create_fifo(&dst_path, metadata.mode())?;
                } else {
                    // Sockets and device nodes are not carried into the rootfs
                    tracing::debug!("Skipping special file: {}", src_path.display());
                    continue;
                }
            }

            #[cfg(not(target_os = "linux"))]
            {
                tracing::debug!("Skipping special file: {}", src_path.display());
                continue;
            }
        }

        copy_metadata(src_path, &dst_path, &metadata, &options)?;
    }

    for (src_path, dst_path, metadata) in dirs_to_finish.iter().rev() {
        copy_metadata(src_path, dst_path, metadata, &options)?;
    }

    Ok(())
}

fn create_dir(path: &Path) -> StrataResult<()> {
    fs::create_dir(path).map_err(|e| {
        StrataError::Storage(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })
}

/// Copy ownership, xattrs, permissions and timestamps from `src` to `dst`.
fn copy_metadata(
    src: &Path,
    dst: &Path,
    metadata: &fs::Metadata,
    options: &CopyOptions,
) -> StrataResult<()> {
    let file_type = metadata.file_type();

    // Ownership first, chown can clear setuid bits
    if let Err(e) = std::os::unix::fs::lchown(dst, Some(metadata.uid()), Some(metadata.gid())) {
        if !options.ignore_chown_errors {
            return Err(StrataError::Storage(format!(
                "Failed to chown {}: {}",
                dst.display(),
                e
            )));
        }
        tracing::trace!("Ignoring chown error for {}: {}", dst.display(), e);
    }

    if options.copy_xattrs {
        copy_xattrs(src, dst);
    }

    if !file_type.is_symlink() {
        fs::set_permissions(dst, metadata.permissions()).map_err(|e| {
            StrataError::Storage(format!(
                "Failed to set permissions on {}: {}",
                dst.display(),
                e
            ))
        })?;
    }

    if let (Ok(atime), Ok(mtime)) = (metadata.accessed(), metadata.modified()) {
        set_symlink_times(dst, atime, mtime)?;
    }

    Ok(())
}

/// Copy capability, user and overlay-opaque xattrs. Unsupported filesystems are skipped.
fn copy_xattrs(src: &Path, dst: &Path) {
    let Ok(attrs) = xattr::list(src) else {
        return;
    };

    for attr in attrs {
        let attr_name = attr.to_string_lossy();
        let should_copy = attr_name == "security.capability"
            || attr_name.starts_with("user.")
            || attr_name == "trusted.overlay.opaque";

        if should_copy && let Ok(Some(value)) = xattr::get(src, &attr) {
            let _ = xattr::set(dst, &attr, &value);
        }
    }
}

/// Set access and modification times without following symlinks
fn set_symlink_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> StrataResult<()> {
    use filetime::FileTime;

    filetime::set_symlink_file_times(
        path,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    )
    .map_err(|e| StrataError::Storage(format!("Failed to set times on {}: {}", path.display(), e)))
}

#[cfg(target_os = "linux")]
fn create_fifo(path: &Path, mode: u32) -> StrataResult<()> {
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    mkfifo(path, Mode::from_bits_truncate(mode & 0o7777)).map_err(|e| {
        StrataError::Storage(format!("Failed to create FIFO {}: {}", path.display(), e))
    })
}
