//! Runtime engine that tracks containers for one supervisor.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use skiff_common::config::{ContainerConfig, RuntimeConfig};
use skiff_common::error::{Result, SkiffError};
use skiff_common::types::{ContainerId, ContainerState};

use crate::backend::{IsolationBackend, LinuxBackend};
use crate::container::{Container, ContainerHandle};

/// Registry entry of one container.
#[derive(Debug, Clone)]
struct Record {
    handle: ContainerHandle,
    container: Arc<Mutex<Container>>,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct Registry {
    records: HashMap<ContainerId, Record>,
    identities: HashMap<String, ContainerId>,
    addresses: HashMap<Ipv4Addr, ContainerId>,
}

impl Registry {
    /// Frees the identity and address held by `id`.
    fn release_claims(&mut self, id: &ContainerId) {
        self.identities.retain(|_, owner| owner != id);
        self.addresses.retain(|_, owner| owner != id);
    }
}

/// The runtime engine that coordinates all container operations.
///
/// Every container sits behind its own lock, so a lifecycle operation on one
/// container never blocks another, and [`Engine::status`] only ever sees a
/// state the state machine settled in. Live containers may not share an
/// identity or an address.
pub struct Engine {
    backend: Arc<dyn IsolationBackend>,
    registry: Mutex<Registry>,
}

impl Engine {
    /// Creates an engine on the Linux backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be set up.
    pub fn new(runtime: RuntimeConfig) -> Result<Self> {
        Ok(Self::with_backend(Arc::new(LinuxBackend::new(runtime)?)))
    }

    /// Creates an engine on a custom backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            backend,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Validates `config` and registers a container in the `Created` state.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidConfig`] for an invalid configuration and
    /// [`SkiffError::AlreadyExists`] if a live container already has the
    /// same identity or address.
    pub fn create(&self, config: ContainerConfig) -> Result<ContainerHandle> {
        let container = Container::new(config, Arc::clone(&self.backend))?;
        let handle = container.handle().clone();
        let (identity, address) = (container.config().host_name.clone(), container.config().ip);

        let mut registry = self.registry();
        if registry.identities.contains_key(&identity) {
            return Err(SkiffError::AlreadyExists {
                kind: "container identity",
                value: identity,
            });
        }
        if registry.addresses.contains_key(&address) {
            return Err(SkiffError::AlreadyExists {
                kind: "container address",
                value: address.to_string(),
            });
        }

        let _ = registry.identities.insert(identity, handle.id.clone());
        let _ = registry.addresses.insert(address, handle.id.clone());
        let record = Record {
            handle: handle.clone(),
            cancel: container.cancel_flag(),
            container: Arc::new(Mutex::new(container)),
        };
        let _ = registry.records.insert(handle.id.clone(), record);
        tracing::info!(id = %handle.id, name = %handle.name, "container registered");
        Ok(handle)
    }

    /// Starts a registered container.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] for an unknown handle, otherwise the
    /// error of [`Container::start`].
    pub fn start_container(&self, handle: &ContainerHandle) -> Result<()> {
        let record = self.record(handle)?;
        let mut container = lock(&record.container);
        let result = container.start();
        if container.state().is_terminal() {
            self.registry().release_claims(&handle.id);
        }
        result
    }

    /// Creates and starts a container.
    ///
    /// A container whose start fails stays registered in its terminal state
    /// and shows up in [`Engine::list`]. Use [`Engine::create`] and
    /// [`Engine::start_container`] to keep hold of its handle.
    ///
    /// # Errors
    ///
    /// Returns the error of [`Engine::create`] or [`Engine::start_container`].
    pub fn start(&self, config: ContainerConfig) -> Result<ContainerHandle> {
        let handle = self.create(config)?;
        self.start_container(&handle)?;
        Ok(handle)
    }

    /// Stops a container, cancelling its start if one is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] for an unknown handle and
    /// [`SkiffError::Teardown`] if a release step failed.
    pub fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let record = self.record(handle)?;
        record.cancel.store(true, Ordering::SeqCst);
        let result = lock(&record.container).stop();
        self.registry().release_claims(&handle.id);
        result
    }

    /// Forgets a container that is `Created`, `Stopped` or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] for an unknown handle and
    /// [`SkiffError::InvalidTransition`] while the container is starting or
    /// running.
    pub fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let record = self.record(handle)?;
        let container = lock(&record.container);
        let state = container.state();
        if !(state.is_terminal() || state == ContainerState::Created) {
            return Err(SkiffError::InvalidTransition {
                operation: "remove",
                state,
            });
        }
        let mut registry = self.registry();
        let _ = registry.records.remove(&handle.id);
        registry.release_claims(&handle.id);
        drop(registry);
        drop(container);
        tracing::info!(id = %handle.id, "container removed");
        Ok(())
    }

    /// Current state of a container.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] for an unknown handle.
    pub fn status(&self, handle: &ContainerHandle) -> Result<ContainerState> {
        let record = self.record(handle)?;
        let state = lock(&record.container).state();
        Ok(state)
    }

    /// Why a running container is not confined, if confinement failed.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] for an unknown handle.
    pub fn confinement_error(&self, handle: &ContainerHandle) -> Result<Option<String>> {
        let record = self.record(handle)?;
        let message = lock(&record.container)
            .confinement_error()
            .map(ToString::to_string);
        Ok(message)
    }

    /// Every registered container with its state, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<(ContainerHandle, ContainerState)> {
        let records: Vec<Record> = self.registry().records.values().cloned().collect();
        let mut list: Vec<_> = records
            .into_iter()
            .map(|record| {
                let state = lock(&record.container).state();
                (record.handle, state)
            })
            .collect();
        list.sort_by(|(a, _), (b, _)| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        list
    }

    fn record(&self, handle: &ContainerHandle) -> Result<Record> {
        self.registry()
            .records
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| SkiffError::NotFound {
                kind: "container",
                id: handle.id.to_string(),
            })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
