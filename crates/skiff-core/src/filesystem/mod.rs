//! Root filesystem switching for the container process.
//!
//! [`switch_root`] runs inside the container's mount namespace after the
//! network has been attached. It leaves the process with `root_dir` as `/`,
//! the pseudo-filesystems a normal userland expects, and no path back to the
//! host's root.

#[cfg(target_os = "linux")]
pub mod mount;
#[cfg(target_os = "linux")]
pub mod pivot_root;

use std::path::Path;

use skiff_common::error::{Result, SkiffError};

/// Replaces the calling process's root with `root_dir`.
///
/// Steps, in order: make every inherited mount private, bind `root_dir`
/// onto itself so it is a mount point, mount `/proc`, `/sys` and a minimal
/// `/dev` beneath it, then `pivot_root` and detach the old root.
///
/// # Errors
///
/// Returns [`SkiffError::RootSwitch`] if `root_dir` is not a directory or any
/// mount step fails. A partially switched process must not continue.
#[cfg(target_os = "linux")]
pub fn switch_root(root_dir: &Path) -> Result<()> {
    let root = checked_root(root_dir)?;
    tracing::info!(root = %root.display(), "switching root filesystem");

    mount::make_mounts_private()?;
    mount::bind_mount(&root, &root)?;
    mount::mount_pseudo_filesystems(&root)?;
    pivot_root::pivot_root(&root)?;

    tracing::info!("root filesystem switched");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; `pivot_root` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn switch_root(root_dir: &Path) -> Result<()> {
    let _ = checked_root(root_dir)?;
    Err(SkiffError::RootSwitch {
        message: "Linux required for native container operations".into(),
    })
}

/// Resolves `root_dir` to an absolute directory suitable as a mount target.
fn checked_root(root_dir: &Path) -> Result<std::path::PathBuf> {
    if !root_dir.is_dir() {
        return Err(SkiffError::RootSwitch {
            message: format!("{} is not a directory", root_dir.display()),
        });
    }
    root_dir.canonicalize().map_err(|e| SkiffError::RootSwitch {
        message: format!("cannot resolve {}: {e}", root_dir.display()),
    })
}
