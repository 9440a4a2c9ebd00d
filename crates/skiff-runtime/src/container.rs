//! Core container struct and lifecycle operations.
//!
//! [`Container::start`] walks `Created -> NetworkAttached -> RootSwitched ->
//! Running`. Every resource acquired on the way is recorded in the
//! container's ledger, and every exit from the state machine other than
//! success releases the ledger in reverse order: process, cgroup, network.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use skiff_common::config::ContainerConfig;
use skiff_common::error::{Result, SkiffError};
use skiff_common::types::{ContainerId, ContainerState};
use skiff_core::cgroup::CgroupHandle;
use skiff_core::network::NetworkLink;

use crate::backend::{ContainerProcess, IsolationBackend};

/// Caller-facing token for a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Unique identifier.
    pub id: ContainerId,
    /// Container identity (its hostname).
    pub name: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Resources acquired by a start, in acquisition order.
#[derive(Debug, Default)]
struct Ledger {
    process: Option<Box<dyn ContainerProcess>>,
    network: Option<NetworkLink>,
    cgroup: Option<CgroupHandle>,
}

/// A single container instance driven through its lifecycle.
pub struct Container {
    handle: ContainerHandle,
    config: ContainerConfig,
    state: ContainerState,
    ledger: Ledger,
    exit_code: Option<i32>,
    confinement_error: Option<SkiffError>,
    backend: Arc<dyn IsolationBackend>,
    cancel: Arc<AtomicBool>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("ledger", &self.ledger)
            .field("exit_code", &self.exit_code)
            .field("confinement_error", &self.confinement_error)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Validates `config` and creates a container in the `Created` state.
    ///
    /// Nothing is allocated on the host until [`Container::start`].
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: ContainerConfig, backend: Arc<dyn IsolationBackend>) -> Result<Self> {
        config.validate()?;
        let handle = ContainerHandle {
            id: ContainerId::generate(),
            name: config.host_name.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        tracing::debug!(id = %handle.id, name = %handle.name, "container created");
        Ok(Self {
            handle,
            config,
            state: ContainerState::Created,
            ledger: Ledger::default(),
            exit_code: None,
            confinement_error: None,
            backend,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Unique identifier.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.handle.id
    }

    /// Caller-facing handle.
    #[must_use]
    pub const fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    /// Configuration the container was created from.
    #[must_use]
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    /// Host PID of the container process while it is alive.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.ledger.process.as_ref().map(|process| process.pid())
    }

    /// The container's network link while it is attached.
    #[must_use]
    pub const fn network(&self) -> Option<&NetworkLink> {
        self.ledger.network.as_ref()
    }

    /// The container's cgroup while it is confined.
    #[must_use]
    pub const fn cgroup(&self) -> Option<&CgroupHandle> {
        self.ledger.cgroup.as_ref()
    }

    /// Why the running container is not confined, if confinement failed.
    #[must_use]
    pub const fn confinement_error(&self) -> Option<&SkiffError> {
        self.confinement_error.as_ref()
    }

    /// Flag that, once set, makes an in-progress [`Container::start`] roll
    /// back at its next step and end `Stopped`.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Starts the container and returns once its entry point is executing.
    ///
    /// On failure every acquired resource is released and the container
    /// ends `Failed`, or `Stopped` if the start was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidTransition`] unless the container is
    /// `Created`, [`SkiffError::Cancelled`] if the cancel flag was raised,
    /// and otherwise the error of the step that failed.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ContainerState::Created {
            return Err(SkiffError::InvalidTransition {
                operation: "start",
                state: self.state,
            });
        }
        tracing::info!(id = %self.handle.id, name = %self.handle.name, "starting container");

        match self.run_start() {
            Ok(()) => {
                tracing::info!(
                    id = %self.handle.id,
                    pid = ?self.pid(),
                    confined = self.confinement_error.is_none(),
                    "container running"
                );
                Ok(())
            }
            Err(e) => {
                let end = if matches!(e, SkiffError::Cancelled { .. }) {
                    ContainerState::Stopped
                } else {
                    ContainerState::Failed
                };
                tracing::warn!(id = %self.handle.id, state = %self.state, error = %e, "start failed, rolling back");
                if let Err(teardown) = self.release_all() {
                    tracing::warn!(id = %self.handle.id, error = %teardown, "rollback incomplete");
                }
                self.transition(end);
                Err(e)
            }
        }
    }

    /// Stops the container and releases its resources.
    ///
    /// A `Created` container becomes `Stopped` directly; stopping a
    /// `Stopped` or `Failed` container does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Teardown`] listing every step that failed. The
    /// container is `Stopped` either way.
    pub fn stop(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        tracing::info!(id = %self.handle.id, "stopping container");
        let result = self.release_all();
        self.transition(ContainerState::Stopped);
        result
    }

    /// Blocks until the entry point exits and returns its exit code.
    ///
    /// After a stop or a failed start this is the code the process was
    /// reaped with.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidTransition`] if the container never had
    /// a process.
    pub fn wait(&mut self) -> Result<i32> {
        if let Some(process) = self.ledger.process.as_mut() {
            return process.wait();
        }
        self.exit_code.ok_or(SkiffError::InvalidTransition {
            operation: "wait on",
            state: self.state,
        })
    }

    fn run_start(&mut self) -> Result<()> {
        self.checkpoint()?;
        let process = self.backend.spawn(&self.config)?;
        let pid = process.pid();
        self.ledger.process = Some(process);

        self.checkpoint()?;
        let link = self.backend.attach_network(pid, &self.config)?;
        self.ledger.network = Some(link);
        self.transition(ContainerState::NetworkAttached);

        self.checkpoint()?;
        self.process()?.signal_network_ready()?;
        self.process()?.await_root_switch()?;
        self.transition(ContainerState::RootSwitched);

        self.checkpoint()?;
        match self.backend.confine(&self.handle.id, pid, &self.config.limits) {
            Ok(cgroup) => self.ledger.cgroup = Some(cgroup),
            Err(e) if e.is_soft() => {
                tracing::warn!(id = %self.handle.id, error = %e, "container will run unconfined");
                self.confinement_error = Some(e);
            }
            Err(e) => return Err(e),
        }

        self.checkpoint()?;
        self.process()?.signal_proceed()?;
        self.process()?.await_exec()?;
        self.transition(ContainerState::Running);
        Ok(())
    }

    fn process(&mut self) -> Result<&mut Box<dyn ContainerProcess>> {
        let id = &self.handle.id;
        self.ledger.process.as_mut().ok_or_else(|| SkiffError::NotFound {
            kind: "container process",
            id: id.to_string(),
        })
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SkiffError::Cancelled {
                id: self.handle.id.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: ContainerState) {
        tracing::debug!(id = %self.handle.id, from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    /// Releases the ledger in reverse acquisition order, continuing past
    /// failures.
    fn release_all(&mut self) -> Result<()> {
        let mut errors = Vec::new();

        // Dropping the process closes the supervisor's channel ends.
        if let Some(mut process) = self.ledger.process.take() {
            match process.terminate().and_then(|()| process.wait()) {
                Ok(code) => self.exit_code = Some(code),
                Err(e) => {
                    tracing::warn!(id = %self.handle.id, error = %e, "failed to terminate container process");
                    errors.push(format!("terminate process: {e}"));
                }
            }
        }
        if let Some(cgroup) = self.ledger.cgroup.take() {
            if let Err(e) = self.backend.release(&cgroup) {
                tracing::warn!(id = %self.handle.id, error = %e, "failed to release cgroup");
                errors.push(format!("release cgroup: {e}"));
            }
        }
        if let Some(link) = self.ledger.network.take() {
            if let Err(e) = self.backend.detach_network(&link) {
                tracing::warn!(id = %self.handle.id, error = %e, "failed to detach network");
                errors.push(format!("detach network: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SkiffError::Teardown { errors })
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.state.is_terminal() || self.state == ContainerState::Created {
            return;
        }
        tracing::warn!(id = %self.handle.id, state = %self.state, "container dropped while live, releasing");
        if let Err(e) = self.release_all() {
            tracing::warn!(id = %self.handle.id, error = %e, "release on drop incomplete");
        }
    }
}
