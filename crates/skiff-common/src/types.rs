//! Domain primitive types used across the skiff workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes (`memory.max`).
    pub memory_bytes: Option<u64>,
    /// CPU shares on the cgroup v1 scale (2..=262144), converted to `cpu.weight`.
    pub cpu_shares: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Some(constants::DEFAULT_MEMORY_BYTES),
            cpu_shares: Some(constants::DEFAULT_CPU_SHARES),
        }
    }
}

impl ResourceLimits {
    /// Limits that leave the group unconstrained.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            memory_bytes: None,
            cpu_shares: None,
        }
    }
}

/// Lifecycle state of a container.
///
/// `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Container has been created but not yet started.
    Created,
    /// The veth pair is wired into the container's network namespace.
    NetworkAttached,
    /// The container process has pivoted into its root filesystem.
    RootSwitched,
    /// The entry point is executing.
    Running,
    /// The container was stopped and its resources released.
    Stopped,
    /// The container hit an unrecoverable error.
    Failed,
}

impl ContainerState {
    /// Returns `true` if no transition leaves this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::NetworkAttached => write!(f, "network-attached"),
            Self::RootSwitched => write!(f, "root-switched"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
