//! Strata - container root filesystem provisioner
//!
//! Turns image names into writable root filesystems assembled from
//! read-only layers, tracks which container owns which rootfs, and
//! reconciles that bookkeeping with the disk after a restart.
//!
//! ```no_run
//! # async fn demo() -> strata::StrataResult<()> {
//! use strata::{ContainerId, Image, Provisioner, ProvisionerOptions};
//!
//! let provisioner = Provisioner::create(ProvisionerOptions::with_work_dir("/var/lib/strata"))?;
//! provisioner.recover(Default::default(), Default::default()).await?;
//!
//! let container = ContainerId::new("c1")?;
//! let rootfs = provisioner
//!     .provision(container.clone(), Image::docker("library/nginx:1.9"))
//!     .await?;
//! println!("rootfs at {}", rootfs.display());
//!
//! provisioner.destroy(container).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod image;
pub mod lock;
pub mod options;
pub mod paths;
pub mod provisioner;
pub mod store;
pub mod util;

pub use backend::{Backend, BackendRegistry, available_backends};
pub use image::{Image, ImageKind, ImageName, ResolvedImage};
pub use lock::ProvisionerLock;
pub use options::{BackendOptions, ProvisionerOptions};
pub use paths::ContainerId;
pub use provisioner::{Info, Provisioner};
pub use store::{LocalStore, Store};
pub use util::init_logging;

pub use strata_shared::{ErrorCategory, RootfsFailure, StrataError, StrataResult};
