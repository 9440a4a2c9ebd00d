//! Linux namespace management for container isolation.
//!
//! [`create_isolated`] clones the container process directly into fresh
//! namespaces, so no user code ever runs in the host's namespaces. The
//! returned [`ProcessHandle`] holds only the pid and the verified namespace
//! identifiers. It owns no descriptor, so the child's namespaces go away
//! with the child.

pub mod uts;

use std::collections::BTreeMap;
use std::fmt;

use nix::sched::CloneFlags;
use nix::unistd::Pid;
use skiff_common::error::{Result, SkiffError};

/// Kinds of namespace the runtime isolates a container in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NamespaceKind {
    /// Hostname and domain name.
    Uts,
    /// Mount table.
    Mount,
    /// Process ID space.
    Pid,
    /// Network stack.
    Network,
    /// System V IPC and POSIX message queues.
    Ipc,
}

impl NamespaceKind {
    /// Every kind, in creation order.
    pub const ALL: [Self; 5] = [Self::Uts, Self::Mount, Self::Pid, Self::Network, Self::Ipc];

    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Uts => "uts",
            Self::Mount => "mnt",
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Ipc => "ipc",
        }
    }

    /// `clone(2)` flag that creates this namespace.
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Network => CloneFlags::CLONE_NEWNET,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// Configuration for which namespaces to create.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            uts: true,
            mount: true,
            pid: true,
            network: true,
            ipc: true,
        }
    }
}

impl NamespaceConfig {
    /// Returns the enabled namespace kinds.
    #[must_use]
    pub fn kinds(&self) -> Vec<NamespaceKind> {
        NamespaceKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                NamespaceKind::Uts => self.uts,
                NamespaceKind::Mount => self.mount,
                NamespaceKind::Pid => self.pid,
                NamespaceKind::Network => self.network,
                NamespaceKind::Ipc => self.ipc,
            })
            .collect()
    }

    /// Combined `clone(2)` flags for the enabled namespaces.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        self.kinds()
            .into_iter()
            .fold(CloneFlags::empty(), |flags, kind| flags | kind.clone_flag())
    }
}

/// Namespace identifiers (kernel inode numbers) a process belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    ids: BTreeMap<NamespaceKind, u64>,
}

impl NamespaceSet {
    /// Reads the identifiers of the given kinds from `/proc/<pid>/ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if a namespace link cannot be read or parsed.
    pub fn of_process(pid: Pid, kinds: &[NamespaceKind]) -> Result<Self> {
        let mut ids = BTreeMap::new();
        for &kind in kinds {
            let path = format!("/proc/{pid}/ns/{}", kind.proc_name());
            let target = std::fs::read_link(&path).map_err(|e| SkiffError::Io {
                path: path.clone().into(),
                source: e,
            })?;
            let id = parse_ns_link(&target.to_string_lossy()).ok_or_else(|| {
                SkiffError::NamespaceCreation {
                    message: format!("unrecognised namespace link {}", target.display()),
                }
            })?;
            let _ = ids.insert(kind, id);
        }
        Ok(Self { ids })
    }

    /// Returns the identifier of one namespace kind, if recorded.
    #[must_use]
    pub fn get(&self, kind: NamespaceKind) -> Option<u64> {
        self.ids.get(&kind).copied()
    }

    /// Kinds whose identifier is the same in both sets.
    #[must_use]
    pub fn shared_with(&self, other: &Self) -> Vec<NamespaceKind> {
        self.ids
            .iter()
            .filter(|&(kind, id)| other.get(*kind) == Some(*id))
            .map(|(kind, _)| *kind)
            .collect()
    }
}

/// Parses a namespace link target such as `net:[4026531840]`.
fn parse_ns_link(target: &str) -> Option<u64> {
    let (_, rest) = target.split_once(":[")?;
    rest.strip_suffix(']')?.parse().ok()
}

/// Supervisor-side reference to an isolated container process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    namespaces: NamespaceSet,
}

impl ProcessHandle {
    /// PID of the container process, as seen from the host.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// PID as an unsigned integer.
    #[must_use]
    pub const fn raw_pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Namespace identifiers the child was verified to own.
    #[must_use]
    pub const fn namespaces(&self) -> &NamespaceSet {
        &self.namespaces
    }
}

/// Spawns `child` in a new process detached into the configured namespaces.
///
/// The child runs `child` to completion and exits with its return value. In
/// the parent, every requested namespace of the child is compared with the
/// caller's own; a child that shares any of them is killed.
///
/// # Errors
///
/// Returns [`SkiffError::NamespaceCreation`] if `clone(2)` fails (usually
/// missing `CAP_SYS_ADMIN`) or the child's namespaces cannot be verified.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn create_isolated<F>(config: &NamespaceConfig, child: F) -> Result<ProcessHandle>
where
    F: FnMut() -> isize,
{
    use skiff_common::constants::CLONE_STACK_SIZE;

    let kinds = config.kinds();
    let mut stack = vec![0_u8; CLONE_STACK_SIZE];

    // SAFETY: no CLONE_VM, so the child runs on a copy of this address space
    // and `stack` outlives the call in the parent. The callback only touches
    // state it owns.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(child),
            &mut stack,
            config.clone_flags(),
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| SkiffError::NamespaceCreation {
        message: format!("clone failed: {e}"),
    })?;
    tracing::debug!(%pid, ?kinds, "container process cloned");

    match verify_isolation(pid, &kinds) {
        Ok(handle) => {
            tracing::info!(%pid, "isolated process created");
            Ok(handle)
        }
        Err(e) => {
            abort_child(pid);
            Err(e)
        }
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn create_isolated<F>(_config: &NamespaceConfig, _child: F) -> Result<ProcessHandle>
where
    F: FnMut() -> isize,
{
    Err(SkiffError::NamespaceCreation {
        message: "Linux required for native container operations".into(),
    })
}

fn verify_isolation(pid: Pid, kinds: &[NamespaceKind]) -> Result<ProcessHandle> {
    let ours = NamespaceSet::of_process(Pid::this(), kinds)?;
    let theirs = NamespaceSet::of_process(pid, kinds)?;
    let shared = theirs.shared_with(&ours);
    if !shared.is_empty() {
        return Err(SkiffError::NamespaceCreation {
            message: format!("child still shares namespaces {shared:?} with the supervisor"),
        });
    }

    Ok(ProcessHandle {
        pid,
        namespaces: theirs,
    })
}

fn abort_child(pid: Pid) {
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::waitpid;

    if let Err(e) = kill(pid, Signal::SIGKILL) {
        tracing::warn!(%pid, error = %e, "failed to kill unverified child");
    }
    let _ = waitpid(pid, None);
}
