//! Mount utilities for container filesystem setup.
//!
//! Handles mounting `/proc`, `/sys`, `/dev`, and bind mounts
//! inside the container's namespace.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::mount::{MsFlags, mount};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use skiff_common::error::{Result, SkiffError};

/// Character devices created in the container's `/dev`: name, major, minor.
pub const DEVICE_NODES: [(&str, u64, u64); 6] = [
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// Symlinks created in the container's `/dev`: name, target.
pub const DEVICE_LINKS: [(&str, &str); 5] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("ptmx", "pts/ptmx"),
];

/// Marks every mount in the current namespace private, recursively.
///
/// Without this, mounts made for the container would propagate back to
/// the host through shared peer groups.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn make_mounts_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| switch_error(format!("making / private failed: {e}")))?;
    tracing::debug!("mount propagation set to private");
    Ok(())
}

/// Creates a recursive bind mount from source to target.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        switch_error(format!(
            "bind mount {} -> {} failed: {e}",
            source.display(),
            target.display()
        ))
    })?;
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    Ok(())
}

/// Mounts essential pseudo-filesystems (`/proc`, `/sys`, `/dev`) inside the container.
///
/// # Errors
///
/// Returns an error if a mount point cannot be created or any mount syscall fails.
pub fn mount_pseudo_filesystems(rootfs: &Path) -> Result<()> {
    let proc_dir = ensure_dir(rootfs, "proc")?;
    mount_fs(
        "proc",
        &proc_dir,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )?;

    let sys_dir = ensure_dir(rootfs, "sys")?;
    mount_fs(
        "sysfs",
        &sys_dir,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY,
        None,
    )?;

    mount_dev(rootfs)?;
    tracing::debug!(rootfs = %rootfs.display(), "pseudo-filesystems mounted");
    Ok(())
}

/// Builds a minimal `/dev` on a fresh tmpfs.
fn mount_dev(rootfs: &Path) -> Result<()> {
    let dev = ensure_dir(rootfs, "dev")?;
    mount_tmpfs(&dev, MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME, "mode=755,size=65536k")?;

    for (name, major, minor) in DEVICE_NODES {
        let node = dev.join(name);
        mknod(
            &node,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(major, minor),
        )
        .map_err(|e| switch_error(format!("mknod {} failed: {e}", node.display())))?;
        // mknod is subject to the umask.
        std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o666))
            .map_err(|e| io_error(&node, &e))?;
    }

    for (name, target) in DEVICE_LINKS {
        let link = dev.join(name);
        std::os::unix::fs::symlink(target, &link).map_err(|e| io_error(&link, &e))?;
    }

    let pts = ensure_dir(&dev, "pts")?;
    mount_fs(
        "devpts",
        &pts,
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )?;

    let shm = ensure_dir(&dev, "shm")?;
    mount_tmpfs(
        &shm,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        "mode=1777,size=65536k",
    )
}

fn mount_tmpfs(target: &Path, flags: MsFlags, options: &str) -> Result<()> {
    mount(Some("tmpfs"), target, Some("tmpfs"), flags, Some(options))
        .map_err(|e| switch_error(format!("tmpfs mount at {} failed: {e}", target.display())))
}

fn mount_fs(fstype: &str, target: &Path, flags: MsFlags, options: Option<&str>) -> Result<()> {
    mount(Some(fstype), target, Some(fstype), flags, options).map_err(|e| {
        switch_error(format!("{fstype} mount at {} failed: {e}", target.display()))
    })
}

fn ensure_dir(parent: &Path, name: &str) -> Result<std::path::PathBuf> {
    let dir = parent.join(name);
    std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e))?;
    Ok(dir)
}

fn io_error(path: &Path, e: &std::io::Error) -> SkiffError {
    switch_error(format!("{}: {e}", path.display()))
}

const fn switch_error(message: String) -> SkiffError {
    SkiffError::RootSwitch { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_table_covers_standard_nodes() {
        let names: Vec<_> = DEVICE_NODES.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, ["null", "zero", "full", "random", "urandom", "tty"]);
        assert!(DEVICE_NODES.contains(&("null", 1, 3)));
    }

    #[test]
    fn device_links_point_into_proc_or_pts() {
        for (_, target) in DEVICE_LINKS {
            assert!(target.starts_with("/proc/self/fd") || target.starts_with("pts/"));
        }
    }

    #[test]
    fn ensure_dir_creates_missing_mount_points() {
        let dir = tempfile::tempdir().expect("tempdir");
        let created = ensure_dir(dir.path(), "proc").expect("create");
        assert!(created.is_dir());
        let again = ensure_dir(dir.path(), "proc").expect("idempotent");
        assert_eq!(created, again);
    }
}
