//! Recording isolation backend shared by the lifecycle and engine tests.
//!
//! Keeps a journal of every backend call and a model of the host: live veth
//! pairs, live cgroups, and bridges. Faults can be injected per step.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skiff_common::config::ContainerConfig;
use skiff_common::error::{Result, SkiffError};
use skiff_common::types::{ContainerId, ResourceLimits};
use skiff_core::cgroup::CgroupHandle;
use skiff_core::network::NetworkLink;
use skiff_runtime::backend::{ContainerProcess, IsolationBackend};

/// Step at which the fake backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Spawn,
    Network,
    RootSwitch,
    Cgroup,
    Exec,
    Detach,
}

/// Shared view of the simulated host.
#[derive(Debug, Default)]
pub struct Host {
    events: Mutex<Vec<String>>,
    veths: Mutex<BTreeSet<String>>,
    cgroups: Mutex<BTreeSet<String>>,
    bridges: Mutex<BTreeSet<String>>,
    live_processes: Mutex<BTreeSet<u32>>,
    open_handles: Mutex<BTreeSet<u32>>,
}

impl Host {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Events of one container, with the container name stripped.
    pub fn events_of(&self, name: &str) -> Vec<String> {
        let suffix = format!(" {name}");
        self.events()
            .into_iter()
            .filter_map(|event| event.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub fn veths(&self) -> BTreeSet<String> {
        self.veths.lock().unwrap().clone()
    }

    pub fn cgroups(&self) -> BTreeSet<String> {
        self.cgroups.lock().unwrap().clone()
    }

    pub fn bridges(&self) -> BTreeSet<String> {
        self.bridges.lock().unwrap().clone()
    }

    pub fn live_processes(&self) -> BTreeSet<u32> {
        self.live_processes.lock().unwrap().clone()
    }

    /// Process handles the runtime still holds, dead or alive.
    pub fn open_handles(&self) -> BTreeSet<u32> {
        self.open_handles.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct FakeBackend {
    pub host: Arc<Host>,
    faults: HashMap<String, Fault>,
    next_pid: AtomicU32,
    names: Mutex<HashMap<u32, String>>,
    attach_delay: Duration,
    cancel_on_attach: Mutex<Option<Arc<AtomicBool>>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            host: Arc::default(),
            faults: HashMap::new(),
            next_pid: AtomicU32::new(1000),
            names: Mutex::default(),
            attach_delay: Duration::ZERO,
            cancel_on_attach: Mutex::default(),
        }
    }
}

impl FakeBackend {
    /// Fails `step` for the container named `name`.
    pub fn with_fault(mut self, name: &str, fault: Fault) -> Self {
        let _ = self.faults.insert(name.to_string(), fault);
        self
    }

    /// Slows every network attach down, to widen race windows.
    pub const fn with_attach_delay(mut self, delay: Duration) -> Self {
        self.attach_delay = delay;
        self
    }

    /// Raises `flag` while the next network attach is in progress.
    pub fn cancel_during_attach(&self, flag: Arc<AtomicBool>) {
        *self.cancel_on_attach.lock().unwrap() = Some(flag);
    }

    fn fault(&self, name: &str) -> Option<Fault> {
        self.faults.get(name).copied()
    }

    fn name_of(&self, pid: u32) -> String {
        self.names.lock().unwrap().get(&pid).cloned().unwrap_or_default()
    }
}

impl IsolationBackend for FakeBackend {
    fn spawn(&self, config: &ContainerConfig) -> Result<Box<dyn ContainerProcess>> {
        let name = config.host_name.clone();
        self.host.record(format!("spawn {name}"));
        if self.fault(&name) == Some(Fault::Spawn) {
            return Err(SkiffError::NamespaceCreation {
                message: "clone failed: EPERM".into(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let _ = self.names.lock().unwrap().insert(pid, name.clone());
        let _ = self.host.live_processes.lock().unwrap().insert(pid);
        let _ = self.host.open_handles.lock().unwrap().insert(pid);
        Ok(Box::new(FakeProcess {
            pid,
            fault: self.fault(&name),
            name,
            host: Arc::clone(&self.host),
            exited: false,
        }))
    }

    fn attach_network(&self, pid: u32, config: &ContainerConfig) -> Result<NetworkLink> {
        let name = self.name_of(pid);
        self.host.record(format!("attach {name}"));
        std::thread::sleep(self.attach_delay);
        if let Some(flag) = self.cancel_on_attach.lock().unwrap().take() {
            flag.store(true, Ordering::SeqCst);
        }
        let _ = self.host.bridges.lock().unwrap().insert(config.bridge_name.clone());
        if self.fault(&name) == Some(Fault::Network) {
            return Err(SkiffError::NetworkSetup {
                step: "move peer into namespace",
                message: "RTNETLINK answers: Invalid argument".into(),
            });
        }
        let host_ifname = format!("h-{name}");
        let _ = self.host.veths.lock().unwrap().insert(host_ifname.clone());
        Ok(NetworkLink {
            host_ifname,
            peer_ifname: format!("p-{name}"),
            container_ifname: "eth0".into(),
            bridge_name: config.bridge_name.clone(),
            container_ip: config.ip,
            prefix_len: config.prefix_len,
        })
    }

    fn detach_network(&self, link: &NetworkLink) -> Result<()> {
        let name = link.host_ifname.trim_start_matches("h-").to_string();
        self.host.record(format!("detach {name}"));
        if self.fault(&name) == Some(Fault::Detach) {
            return Err(SkiffError::NetworkSetup {
                step: "delete veth pair",
                message: "Operation not permitted".into(),
            });
        }
        let _ = self.host.veths.lock().unwrap().remove(&link.host_ifname);
        Ok(())
    }

    fn confine(&self, id: &ContainerId, pid: u32, _limits: &ResourceLimits) -> Result<CgroupHandle> {
        let name = self.name_of(pid);
        self.host.record(format!("confine {name}"));
        if self.fault(&name) == Some(Fault::Cgroup) {
            return Err(SkiffError::Cgroup {
                message: "cgroup v2 hierarchy unavailable".into(),
            });
        }
        let _ = self.host.cgroups.lock().unwrap().insert(name.clone());
        Ok(CgroupHandle::new(id.clone(), PathBuf::from("/fake").join(name)))
    }

    fn release(&self, handle: &CgroupHandle) -> Result<()> {
        let name = handle
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        self.host.record(format!("release {name}"));
        let _ = self.host.cgroups.lock().unwrap().remove(&name);
        Ok(())
    }
}

#[derive(Debug)]
struct FakeProcess {
    pid: u32,
    name: String,
    fault: Option<Fault>,
    host: Arc<Host>,
    exited: bool,
}

impl FakeProcess {
    fn exit(&mut self) {
        self.exited = true;
        let _ = self.host.live_processes.lock().unwrap().remove(&self.pid);
    }
}

impl ContainerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal_network_ready(&mut self) -> Result<()> {
        self.host.record(format!("network-ready {}", self.name));
        Ok(())
    }

    fn await_root_switch(&mut self) -> Result<()> {
        self.host.record(format!("root-switched {}", self.name));
        if self.fault == Some(Fault::RootSwitch) {
            self.exit();
            return Err(SkiffError::RootSwitch {
                message: "pivot_root: Invalid argument".into(),
            });
        }
        Ok(())
    }

    fn signal_proceed(&mut self) -> Result<()> {
        self.host.record(format!("proceed {}", self.name));
        Ok(())
    }

    fn await_exec(&mut self) -> Result<()> {
        self.host.record(format!("exec {}", self.name));
        if self.fault == Some(Fault::Exec) {
            self.exit();
            return Err(SkiffError::Handoff {
                message: "container exec failed: /bin/sh: not found".into(),
            });
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.host.record(format!("terminate {}", self.name));
        self.exit();
        Ok(())
    }

    fn wait(&mut self) -> Result<i32> {
        self.exit();
        Ok(0)
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        let _ = self.host.open_handles.lock().unwrap().remove(&self.pid);
    }
}

/// A valid configuration for container `name` at `172.16.0.<host>`.
pub fn config(root: &std::path::Path, name: &str, host: u8) -> ContainerConfig {
    ContainerConfig::new(
        name,
        root,
        Ipv4Addr::new(172, 16, 0, host),
        "docker0",
        Ipv4Addr::new(172, 16, 0, 1),
    )
}
