//! Cgroups v2 resource management.
//!
//! Creates one group per container under `<root>/<parent>/<container_id>`
//! on the unified hierarchy, applies CPU and memory limits, and moves the
//! container process into it. Every failure here is reported as
//! [`SkiffError::Cgroup`], which callers treat as soft.

pub mod cpu;
pub mod memory;

use std::path::{Path, PathBuf};
use std::time::Duration;

use skiff_common::error::{Result, SkiffError};
use skiff_common::types::{ContainerId, ResourceLimits};

/// Controllers delegated to the per-container groups.
const CONTROLLERS: &str = "+cpu +memory";

/// Attempts made to remove a group the kernel still reports busy.
const REMOVE_ATTEMPTS: u32 = 20;

/// Pause between removal attempts.
const REMOVE_BACKOFF: Duration = Duration::from_millis(25);

/// Handle to the cgroup of a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    container_id: ContainerId,
    path: PathBuf,
}

impl CgroupHandle {
    /// Wraps an existing group directory.
    #[must_use]
    pub const fn new(container_id: ContainerId, path: PathBuf) -> Self {
        Self { container_id, path }
    }

    /// Container owning the group.
    #[must_use]
    pub const fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Directory of the group in the cgroup filesystem.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates and removes per-container groups below one parent directory.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
    parent: PathBuf,
}

impl CgroupController {
    /// Creates a controller for groups under `<root>/<parent>`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, parent: &str) -> Self {
        let root = root.into();
        let parent = root.join(parent);
        Self { root, parent }
    }

    /// Returns whether a cgroup v2 unified hierarchy is mounted at the root.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.root.join("cgroup.controllers").is_file()
    }

    /// Directory the group of `container_id` lives in.
    #[must_use]
    pub fn group_path(&self, container_id: &ContainerId) -> PathBuf {
        self.parent.join(container_id.as_str())
    }

    /// Creates a group for `container_id`, applies `limits`, and adds `pid`
    /// as its only member.
    ///
    /// A group left behind by a failed step is removed before returning.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Cgroup`] if the hierarchy is unavailable, the
    /// group already exists, or any control file cannot be written.
    pub fn confine(
        &self,
        container_id: &ContainerId,
        pid: u32,
        limits: &ResourceLimits,
    ) -> Result<CgroupHandle> {
        if !self.is_available() {
            return Err(cgroup_error(format!(
                "cgroup v2 hierarchy unavailable at {}",
                self.root.display()
            )));
        }
        self.prepare_parent()?;

        let path = self.group_path(container_id);
        std::fs::create_dir(&path)
            .map_err(|e| cgroup_error(format!("create {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "cgroup created");

        let handle = CgroupHandle::new(container_id.clone(), path);
        if let Err(e) = Self::populate(&handle, pid, limits) {
            if let Err(cleanup) = std::fs::remove_dir(handle.path()) {
                tracing::warn!(path = %handle.path().display(), error = %cleanup, "failed to remove partial cgroup");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Removes the group, moving any remaining member to the root group first.
    ///
    /// Safe to call after the process has exited or the group is gone.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Cgroup`] if members cannot be migrated or the
    /// directory cannot be removed.
    pub fn release(&self, handle: &CgroupHandle) -> Result<()> {
        let path = handle.path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "cgroup already removed");
            return Ok(());
        }

        for pid in read_members(path)? {
            if let Err(e) = write_control(&self.root, "cgroup.procs", &pid.to_string()) {
                tracing::debug!(pid, error = %e, "member not migrated (likely exited)");
            }
        }

        let mut attempt = 0;
        loop {
            match std::fs::remove_dir(path) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if attempt + 1 < REMOVE_ATTEMPTS => {
                    tracing::debug!(path = %path.display(), error = %e, attempt, "cgroup busy, retrying");
                    attempt += 1;
                    std::thread::sleep(REMOVE_BACKOFF);
                }
                Err(e) => {
                    return Err(cgroup_error(format!("remove {}: {e}", path.display())));
                }
            }
        }
        tracing::info!(path = %path.display(), "cgroup destroyed");
        Ok(())
    }

    /// Creates the parent group and delegates the controllers down to it.
    fn prepare_parent(&self) -> Result<()> {
        std::fs::create_dir_all(&self.parent)
            .map_err(|e| cgroup_error(format!("create {}: {e}", self.parent.display())))?;
        write_control(&self.root, "cgroup.subtree_control", CONTROLLERS)?;
        write_control(&self.parent, "cgroup.subtree_control", CONTROLLERS)
    }

    fn populate(handle: &CgroupHandle, pid: u32, limits: &ResourceLimits) -> Result<()> {
        if let Some(bytes) = limits.memory_bytes {
            memory::set_memory_max(handle.path(), bytes)?;
        }
        if let Some(shares) = limits.cpu_shares {
            cpu::set_cpu_weight(handle.path(), cpu::shares_to_weight(shares))?;
        }
        write_control(handle.path(), "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, path = %handle.path().display(), "added process to cgroup");
        Ok(())
    }
}

/// Writes `value` to the control file `name` in `dir`.
pub(crate) fn write_control(dir: &Path, name: &str, value: &str) -> Result<()> {
    let file = dir.join(name);
    std::fs::write(&file, value)
        .map_err(|e| cgroup_error(format!("write {value:?} to {}: {e}", file.display())))
}

fn read_members(dir: &Path) -> Result<Vec<u32>> {
    let file = dir.join("cgroup.procs");
    match std::fs::read_to_string(&file) {
        Ok(content) => Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(cgroup_error(format!("read {}: {e}", file.display()))),
    }
}

const fn cgroup_error(message: String) -> SkiffError {
    SkiffError::Cgroup { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_hierarchy() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory io pids\n")
            .expect("controllers");
        dir
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).expect("read control file")
    }

    #[test]
    fn confine_writes_limits_and_membership() {
        let root = fake_hierarchy();
        let controller = CgroupController::new(root.path(), "skiff");
        let id = ContainerId::new("c1");

        let handle = controller
            .confine(&id, 4242, &ResourceLimits::default())
            .expect("confine");

        assert_eq!(handle.path(), root.path().join("skiff").join("c1"));
        assert_eq!(read(&handle.path().join("memory.max")), "268435456");
        assert_eq!(read(&handle.path().join("cpu.weight")), "39");
        assert_eq!(read(&handle.path().join("cgroup.procs")), "4242");
        assert_eq!(
            read(&root.path().join("skiff").join("cgroup.subtree_control")),
            "+cpu +memory"
        );
    }

    #[test]
    fn unlimited_skips_limit_files() {
        let root = fake_hierarchy();
        let controller = CgroupController::new(root.path(), "skiff");
        let handle = controller
            .confine(&ContainerId::new("c2"), 1, &ResourceLimits::unlimited())
            .expect("confine");
        assert!(!handle.path().join("memory.max").exists());
        assert!(!handle.path().join("cpu.weight").exists());
    }

    #[test]
    fn missing_hierarchy_is_a_soft_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = CgroupController::new(dir.path(), "skiff");
        let err = controller
            .confine(&ContainerId::new("c1"), 1, &ResourceLimits::default())
            .unwrap_err();
        assert!(err.is_soft());
        assert!(!dir.path().join("skiff").exists());
    }

    #[test]
    fn existing_group_is_not_reused() {
        let root = fake_hierarchy();
        let controller = CgroupController::new(root.path(), "skiff");
        let id = ContainerId::new("dup");
        let _ = controller
            .confine(&id, 1, &ResourceLimits::default())
            .expect("first");
        assert!(controller.confine(&id, 2, &ResourceLimits::default()).is_err());
    }

    #[test]
    fn release_of_missing_group_succeeds() {
        let root = fake_hierarchy();
        let controller = CgroupController::new(root.path(), "skiff");
        let handle = CgroupHandle::new(
            ContainerId::new("gone"),
            controller.group_path(&ContainerId::new("gone")),
        );
        controller.release(&handle).expect("idempotent release");
    }

    #[test]
    fn members_are_read_from_procs_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.procs"), "777\n778\n\n").expect("procs");
        assert_eq!(read_members(dir.path()).expect("members"), vec![777, 778]);
    }

    #[test]
    fn release_removes_empty_group() {
        let root = fake_hierarchy();
        let controller = CgroupController::new(root.path(), "skiff");
        let id = ContainerId::new("c3");
        let group = controller.group_path(&id);
        std::fs::create_dir_all(&group).expect("group dir");

        controller
            .release(&CgroupHandle::new(id, group.clone()))
            .expect("release");
        assert!(!group.exists());
    }

    #[test]
    fn release_reports_undeletable_group() {
        let root = fake_hierarchy();
        let controller = CgroupController::new(root.path(), "skiff");
        let id = ContainerId::new("stuck");
        let group = controller.group_path(&id);
        std::fs::create_dir_all(group.join("child")).expect("nested dir");

        let err = controller
            .release(&CgroupHandle::new(id, group))
            .unwrap_err();
        assert!(err.is_soft());
    }
}
