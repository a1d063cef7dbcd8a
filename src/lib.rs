//! Builds the RescueOS live ISO from a minimal Ubuntu base.
//!
//! The build runs in four phases:
//!
//! ```text
//! provision      debootstrap a jail, stage branding, and mount the private
//!                /dev, /run, and shared apt cache directories
//! guest stage    re-enter this binary under chroot(8) and customize the
//!                tree: packages, boot splash, desktop defaults, and the
//!                on-disc boot scaffold
//! release        unmount everything in reverse acquisition order; the jail
//!                is only deleted after a fully clean release
//! assemble       squashfs the tree, master a hybrid BIOS/UEFI ISO, and
//!                write its checksum
//! ```
//!
//! Every mount, device node, and symlink acquired along the way is tracked
//! by a [`guard::ResourceGuard`], whose release runs on every exit path.
//! Deleting a directory that still has something mounted over it can reach
//! through the mount point into the host, so unreleased resources always
//! veto jail removal.

pub mod assemble;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod guest;
pub mod jail;
pub mod pipeline;
pub mod preflight;
pub mod process;

pub use config::BuilderConfig;
pub use context::BuildContext;
pub use error::BuildError;
