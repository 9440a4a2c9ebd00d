//! Linux backend built on the `skiff-core` primitives.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use skiff_common::config::{ContainerConfig, RuntimeConfig};
use skiff_common::error::{Result, SkiffError};
use skiff_common::types::{ContainerId, ResourceLimits};
use skiff_core::cgroup::{CgroupController, CgroupHandle};
use skiff_core::namespace::{self, NamespaceConfig, ProcessHandle};
use skiff_core::network::{AttachRequest, NetworkBridge, NetworkLink, SystemIp};

use super::{ContainerProcess, IsolationBackend};
use crate::handoff::{HandoffChannel, HandoffMessage};
use crate::init;

/// Interval between exit checks during the stop grace period.
const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// Exit code reported when the status of a reaped process is unknown.
const UNKNOWN_EXIT: i32 = -1;

/// Backend that isolates containers with namespaces, veth pairs and cgroups v2.
#[derive(Debug)]
pub struct LinuxBackend {
    runtime: RuntimeConfig,
    namespaces: NamespaceConfig,
    network: NetworkBridge<SystemIp>,
    cgroups: CgroupController,
}

impl LinuxBackend {
    /// Creates a backend from the supervisor settings.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] if the `ip` or `nsenter` binary
    /// cannot be located.
    pub fn new(runtime: RuntimeConfig) -> Result<Self> {
        let ip = SystemIp::new(runtime.ip_binary.clone(), runtime.nsenter_binary.clone())?;
        let cgroups = CgroupController::new(&runtime.cgroup_root, &runtime.cgroup_parent);
        if !cgroups.is_available() {
            tracing::warn!(root = %runtime.cgroup_root.display(), "cgroup v2 not mounted, containers will run unconfined");
        }
        Ok(Self {
            namespaces: NamespaceConfig::default(),
            network: NetworkBridge::new(ip),
            cgroups,
            runtime,
        })
    }

    /// Replaces the namespaces containers are cloned into.
    ///
    /// The child only sets its hostname in its own UTS namespace and only
    /// switches root in its own mount namespace; with those disabled it keeps
    /// the host's.
    #[must_use]
    pub fn with_namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Supervisor settings the backend was created with.
    #[must_use]
    pub const fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }
}

impl IsolationBackend for LinuxBackend {
    fn spawn(&self, config: &ContainerConfig) -> Result<Box<dyn ContainerProcess>> {
        let (supervisor, mut container) = HandoffChannel::pair()?;
        let timeout = self.runtime.handoff_timeout();

        let handle = namespace::create_isolated(&self.namespaces, || {
            init::container_main(&mut container, config, &self.namespaces, timeout)
        })?;
        // Only the child may hold the container end; its EOF is the exec signal.
        drop(container);

        tracing::info!(pid = handle.raw_pid(), host_name = %config.host_name, "container process spawned");
        Ok(Box::new(LinuxProcess {
            handle,
            channel: supervisor,
            timeout,
            grace: self.runtime.stop_grace(),
            exit_code: None,
        }))
    }

    fn attach_network(&self, pid: u32, config: &ContainerConfig) -> Result<NetworkLink> {
        self.network.attach(pid, &AttachRequest::from_config(config))
    }

    fn detach_network(&self, link: &NetworkLink) -> Result<()> {
        self.network.detach(link)
    }

    fn confine(&self, id: &ContainerId, pid: u32, limits: &ResourceLimits) -> Result<CgroupHandle> {
        self.cgroups.confine(id, pid, limits)
    }

    fn release(&self, handle: &CgroupHandle) -> Result<()> {
        self.cgroups.release(handle)
    }
}

/// A container process cloned by [`LinuxBackend`].
#[derive(Debug)]
pub struct LinuxProcess {
    handle: ProcessHandle,
    channel: HandoffChannel,
    timeout: Duration,
    grace: Duration,
    exit_code: Option<i32>,
}

impl LinuxProcess {
    fn nix_pid(&self) -> Pid {
        self.handle.pid()
    }

    fn expect_message(&mut self, wanted: &HandoffMessage, step: &str) -> Result<()> {
        match self.channel.recv(self.timeout)? {
            Some(message) if &message == wanted => Ok(()),
            Some(HandoffMessage::Failed { stage, message }) => Err(stage.into_error(message)),
            Some(other) => Err(SkiffError::Handoff {
                message: format!("expected {wanted:?} during {step}, got {other:?}"),
            }),
            None => Err(SkiffError::Handoff {
                message: format!("container process exited during {step}"),
            }),
        }
    }

    /// Reaps the process without blocking; `Some(code)` once it has exited.
    fn try_reap(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let code = match waitpid(self.nix_pid(), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => exit_code(status),
            Err(Errno::ECHILD) => Some(UNKNOWN_EXIT),
            Err(e) => return Err(self.process_error(e)),
        };
        if let Some(code) = code {
            tracing::debug!(pid = self.pid(), code, "container process reaped");
            self.exit_code = Some(code);
        }
        Ok(code)
    }

    /// Checks the process after EOF on the channel, which normally means
    /// `execve` closed the child's end.
    fn confirm_exec(&mut self) -> Result<()> {
        let status = match waitpid(self.nix_pid(), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => status,
            Err(Errno::ECHILD) => WaitStatus::StillAlive,
            Err(e) => return Err(self.process_error(e)),
        };
        if self.exit_code.is_none() {
            self.exit_code = exit_code(status);
        }
        exec_status(status)?;
        tracing::debug!(pid = self.pid(), "entry point executed");
        Ok(())
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        match kill(self.nix_pid(), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(self.process_error(e)),
        }
    }

    fn process_error(&self, errno: Errno) -> SkiffError {
        SkiffError::Io {
            path: PathBuf::from(format!("/proc/{}", self.pid())),
            source: errno.into(),
        }
    }
}

impl ContainerProcess for LinuxProcess {
    fn pid(&self) -> u32 {
        self.handle.raw_pid()
    }

    fn signal_network_ready(&mut self) -> Result<()> {
        self.channel.send(&HandoffMessage::NetworkReady)
    }

    fn await_root_switch(&mut self) -> Result<()> {
        self.expect_message(&HandoffMessage::RootSwitched, "root switch")
    }

    fn signal_proceed(&mut self) -> Result<()> {
        self.channel.send(&HandoffMessage::Proceed)
    }

    fn await_exec(&mut self) -> Result<()> {
        match self.channel.recv(self.timeout)? {
            None => self.confirm_exec(),
            Some(HandoffMessage::Failed { stage, message }) => Err(stage.into_error(message)),
            Some(other) => Err(SkiffError::Handoff {
                message: format!("unexpected {other:?} while waiting for exec"),
            }),
        }
    }

    /// The entry point is PID 1 of its namespace and only sees SIGTERM if it
    /// installed a handler; otherwise it is killed after the grace period.
    fn terminate(&mut self) -> Result<()> {
        if self.try_reap()?.is_some() {
            return Ok(());
        }

        self.signal(Signal::SIGTERM)?;
        tracing::info!(pid = self.pid(), "sent SIGTERM");
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if self.try_reap()?.is_some() {
                return Ok(());
            }
            thread::sleep(REAP_INTERVAL);
        }

        self.signal(Signal::SIGKILL)?;
        tracing::info!(pid = self.pid(), "sent SIGKILL");
        let _ = self.wait()?;
        Ok(())
    }

    fn wait(&mut self) -> Result<i32> {
        loop {
            if let Some(code) = self.exit_code {
                return Ok(code);
            }
            match waitpid(self.nix_pid(), None) {
                Ok(status) => self.exit_code = exit_code(status),
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => self.exit_code = Some(UNKNOWN_EXIT),
                Err(e) => return Err(self.process_error(e)),
            }
        }
    }
}

/// Exit code for a terminal wait status; signals map to `128 + signo`.
fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// A process killed by a signal around EOF may have died before `execve`;
/// the two cases look the same, so both count as a failed exec.
fn exec_status(status: WaitStatus) -> Result<()> {
    match status {
        WaitStatus::Signaled(pid, signal, _) => Err(SkiffError::Handoff {
            message: format!("container process {pid} killed by {signal} before its entry point ran"),
        }),
        _ => Ok(()),
    }
}
