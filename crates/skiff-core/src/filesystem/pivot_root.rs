//! Root filesystem switching via `pivot_root(2)`.
//!
//! Unlike `chroot`, this moves the root mount itself; the old root is
//! detached instead of merely hidden.

use std::path::Path;

use nix::mount::{MntFlags, umount2};
use skiff_common::error::{Result, SkiffError};

/// Switches the root filesystem to `new_root` using `pivot_root(2)`.
///
/// The old root is stacked on top of `new_root` by `pivot_root(".", ".")`
/// and then lazily unmounted, so no directory inside `new_root` is created
/// or removed. Containers may share one `new_root`.
///
/// On failure the working directory is restored.
///
/// # Errors
///
/// Returns an error if `pivot_root(2)` or the subsequent cleanup fails.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    let previous = std::env::current_dir().ok();
    nix::unistd::chdir(new_root)
        .map_err(|e| pivot_error(format!("chdir({}) failed: {e}", new_root.display())))?;

    if let Err(e) = nix::unistd::pivot_root(".", ".") {
        if let Some(dir) = previous {
            let _ = std::env::set_current_dir(dir);
        }
        return Err(pivot_error(format!(
            "pivot_root({}) failed: {e}",
            new_root.display()
        )));
    }

    umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| pivot_error(format!("detaching old root failed: {e}")))?;
    nix::unistd::chdir("/").map_err(|e| pivot_error(format!("chdir(/) failed: {e}")))?;

    tracing::info!(new_root = %new_root.display(), "pivot_root complete");
    Ok(())
}

const fn pivot_error(message: String) -> SkiffError {
    SkiffError::RootSwitch { message }
}
