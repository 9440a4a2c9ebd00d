//! Unified error type for the skiff workspace.
//!
//! Every fallible operation in the isolation and lifecycle crates returns
//! [`SkiffError`]. Only [`SkiffError::Cgroup`] is soft: the container may keep
//! running unconfined when it occurs.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SkiffError {
    /// The container configuration was rejected before any resource was touched.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The isolated container process could not be created.
    #[error("namespace creation failed: {message}")]
    NamespaceCreation {
        /// Description of the failure.
        message: String,
    },

    /// A step of the veth/bridge wiring failed.
    #[error("network setup failed during {step}: {message}")]
    NetworkSetup {
        /// Step that failed.
        step: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The host bridge exists but does not match the requested configuration.
    #[error("bridge {bridge} conflicts with the requested setup: expected {expected}, found {found}")]
    BridgeConflict {
        /// Bridge device name.
        bridge: String,
        /// What the configuration asked for.
        expected: String,
        /// What the host currently has.
        found: String,
    },

    /// Switching the container's filesystem root failed.
    #[error("root switch failed: {message}")]
    RootSwitch {
        /// Description of the failure.
        message: String,
    },

    /// The resource-control group could not be created, configured or removed.
    #[error("cgroup error: {message}")]
    Cgroup {
        /// Description of the failure.
        message: String,
    },

    /// One or more teardown steps failed; the remaining steps still ran.
    #[error("teardown incomplete: {}", errors.join("; "))]
    Teardown {
        /// Every error collected during teardown, in the order they occurred.
        errors: Vec<String>,
    },

    /// The supervisor/container handoff channel broke or timed out.
    #[error("handoff failed: {message}")]
    Handoff {
        /// Description of the failure.
        message: String,
    },

    /// An external command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A lifecycle operation is not allowed in the container's current state.
    #[error("cannot {operation} a container in state {state}")]
    InvalidTransition {
        /// Attempted operation.
        operation: &'static str,
        /// State the container was in.
        state: crate::types::ContainerState,
    },

    /// A live container already owns the identity or address.
    #[error("{kind} already in use: {value}")]
    AlreadyExists {
        /// What collided (identity, address).
        kind: &'static str,
        /// The colliding value.
        value: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A stop request interrupted an in-progress start.
    #[error("start of container {id} was cancelled")]
    Cancelled {
        /// Container whose start was cancelled.
        id: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl SkiffError {
    /// Returns `true` for failures that degrade the container instead of aborting it.
    #[must_use]
    pub const fn is_soft(&self) -> bool {
        matches!(self, Self::Cgroup { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cgroup_errors_are_soft() {
        assert!(
            SkiffError::Cgroup {
                message: "no controller".into()
            }
            .is_soft()
        );
        assert!(
            !SkiffError::RootSwitch {
                message: "mount".into()
            }
            .is_soft()
        );
    }

    #[test]
    fn teardown_error_lists_every_step() {
        let err = SkiffError::Teardown {
            errors: vec!["cgroup busy".into(), "veth missing".into()],
        };
        assert_eq!(
            err.to_string(),
            "teardown incomplete: cgroup busy; veth missing"
        );
    }
}
