//! Isolation backend abstraction.
//!
//! The lifecycle state machine in [`crate::container`] only sequences steps
//! and records what it acquired; the steps themselves go through
//! [`IsolationBackend`] and [`ContainerProcess`].

pub mod linux;

use std::fmt;

use skiff_common::config::ContainerConfig;
use skiff_common::error::Result;
use skiff_common::types::{ContainerId, ResourceLimits};
use skiff_core::cgroup::CgroupHandle;
use skiff_core::network::NetworkLink;

pub use self::linux::LinuxBackend;

/// Supervisor-side handle on a spawned container process.
///
/// The process starts blocked on the handoff channel; each method drives
/// or observes one step of the protocol.
pub trait ContainerProcess: Send + fmt::Debug {
    /// Host PID of the process.
    fn pid(&self) -> u32;

    /// Tells the process its network interface is in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the process can no longer be reached.
    fn signal_network_ready(&mut self) -> Result<()>;

    /// Waits for the process to report its root switch.
    ///
    /// # Errors
    ///
    /// Returns the error the process reported, or a handoff error if it
    /// exited or stayed silent past the timeout.
    fn await_root_switch(&mut self) -> Result<()>;

    /// Releases the process to execute its entry point.
    ///
    /// # Errors
    ///
    /// Returns an error if the process can no longer be reached.
    fn signal_proceed(&mut self) -> Result<()>;

    /// Waits until the entry point has been executed.
    ///
    /// # Errors
    ///
    /// Returns an error if the process reported an exec failure.
    fn await_exec(&mut self) -> Result<()>;

    /// Stops the process and reaps it. Succeeds if it already exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be signalled or reaped.
    fn terminate(&mut self) -> Result<()>;

    /// Blocks until the process exits and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be waited on.
    fn wait(&mut self) -> Result<i32>;
}

/// Platform operations a container start is made of.
pub trait IsolationBackend: Send + Sync {
    /// Spawns the container process in its own namespaces, blocked on the
    /// handoff channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the process or its namespaces cannot be created.
    fn spawn(&self, config: &ContainerConfig) -> Result<Box<dyn ContainerProcess>>;

    /// Wires the network namespace of `pid` to the configured bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if any wiring step fails; nothing is left behind.
    fn attach_network(&self, pid: u32, config: &ContainerConfig) -> Result<NetworkLink>;

    /// Removes a link created by [`IsolationBackend::attach_network`].
    ///
    /// # Errors
    ///
    /// Returns an error if the link exists but cannot be removed.
    fn detach_network(&self, link: &NetworkLink) -> Result<()>;

    /// Places `pid` in a new resource-limited group.
    ///
    /// # Errors
    ///
    /// Returns a soft cgroup error if the group cannot be set up.
    fn confine(&self, id: &ContainerId, pid: u32, limits: &ResourceLimits) -> Result<CgroupHandle>;

    /// Removes a group created by [`IsolationBackend::confine`].
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be removed.
    fn release(&self, handle: &CgroupHandle) -> Result<()>;
}
