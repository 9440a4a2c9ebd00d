//! Configuration models: the per-container [`ContainerConfig`] and the
//! supervisor-wide [`RuntimeConfig`].

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, SkiffError};
use crate::types::ResourceLimits;

/// Declarative description of a single container.
///
/// The value is immutable once handed to the runtime. `host_name` doubles as
/// the container's identity: interface names are derived from it and two
/// live containers may not share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// UTS hostname inside the container.
    pub host_name: String,
    /// Directory that becomes the container's `/`.
    pub root_dir: PathBuf,
    /// Address assigned to the container's `eth0`.
    pub ip: Ipv4Addr,
    /// Host bridge the container is attached to.
    pub bridge_name: String,
    /// Address of the bridge, used as the container's default gateway.
    pub bridge_ip: Ipv4Addr,
    /// Prefix length of the subnet shared by `ip` and `bridge_ip`.
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    /// Program and arguments executed inside the container.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: Vec<String>,
    /// Extra environment variables for the entry point.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Resource limits applied to the container's cgroup.
    #[serde(default)]
    pub limits: ResourceLimits,
}

const fn default_prefix_len() -> u8 {
    constants::DEFAULT_PREFIX_LEN
}

fn default_entrypoint() -> Vec<String> {
    vec![constants::DEFAULT_ENTRYPOINT.to_string()]
}

impl ContainerConfig {
    /// Creates a configuration with the default prefix, entry point and limits.
    #[must_use]
    pub fn new(
        host_name: impl Into<String>,
        root_dir: impl Into<PathBuf>,
        ip: Ipv4Addr,
        bridge_name: impl Into<String>,
        bridge_ip: Ipv4Addr,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            root_dir: root_dir.into(),
            ip,
            bridge_name: bridge_name.into(),
            bridge_ip,
            prefix_len: default_prefix_len(),
            entrypoint: default_entrypoint(),
            env: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }

    /// Sets the subnet prefix length.
    #[must_use]
    pub const fn with_prefix_len(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }

    /// Sets the program executed inside the container.
    #[must_use]
    pub fn with_entrypoint<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Replaces the resource limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Checks every invariant of the configuration.
    ///
    /// Has no side effects; a configuration that passes can be handed to the
    /// runtime without any further checks on its shape.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidConfig`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        validate_host_name(&self.host_name)?;
        validate_ifname(&self.bridge_name)?;

        if !self.root_dir.is_dir() {
            return Err(invalid(format!(
                "root_dir {} does not exist or is not a directory",
                self.root_dir.display()
            )));
        }
        if self.entrypoint.first().is_none_or(String::is_empty) {
            return Err(invalid("entrypoint must name a program"));
        }
        if self.env.iter().any(|(k, _)| k.is_empty() || k.contains('=')) {
            return Err(invalid("environment keys must be non-empty and contain no '='"));
        }

        self.validate_addresses()
    }

    /// Returns the network address of the container subnet.
    #[must_use]
    pub fn subnet(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & netmask(self.prefix_len))
    }

    fn validate_addresses(&self) -> Result<()> {
        if !(constants::MIN_PREFIX_LEN..=constants::MAX_PREFIX_LEN).contains(&self.prefix_len) {
            return Err(invalid(format!(
                "prefix_len {} outside {}..={}",
                self.prefix_len,
                constants::MIN_PREFIX_LEN,
                constants::MAX_PREFIX_LEN
            )));
        }
        if self.ip == self.bridge_ip {
            return Err(invalid(format!(
                "container ip and bridge ip are both {}",
                self.ip
            )));
        }

        let mask = netmask(self.prefix_len);
        let network = u32::from(self.bridge_ip) & mask;
        if u32::from(self.ip) & mask != network {
            return Err(invalid(format!(
                "{} is not in the bridge subnet {}/{}",
                self.ip,
                Ipv4Addr::from(network),
                self.prefix_len
            )));
        }

        let broadcast = network | !mask;
        for (field, addr) in [("ip", self.ip), ("bridge_ip", self.bridge_ip)] {
            let raw = u32::from(addr);
            if raw == network || raw == broadcast {
                return Err(invalid(format!(
                    "{field} {addr} is the network or broadcast address of its subnet"
                )));
            }
        }
        Ok(())
    }
}

fn netmask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn validate_host_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("host_name must not be empty"));
    }
    if name.len() > constants::MAX_HOSTNAME_LEN {
        return Err(invalid(format!(
            "host_name longer than {} bytes",
            constants::MAX_HOSTNAME_LEN
        )));
    }
    if name.contains('\0') {
        return Err(invalid("host_name contains a NUL byte"));
    }
    Ok(())
}

fn validate_ifname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > constants::MAX_IFNAME_LEN {
        return Err(invalid(format!(
            "bridge_name must be 1..={} bytes",
            constants::MAX_IFNAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(invalid(format!("bridge_name {name:?} is reserved")));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c == '\0' || c.is_whitespace())
    {
        return Err(invalid(format!("bridge_name {name:?} is not a valid interface name")));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> SkiffError {
    SkiffError::InvalidConfig {
        message: message.into(),
    }
}

/// Supervisor-wide settings shared by every container started by one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Mount point of the cgroup v2 unified hierarchy.
    pub cgroup_root: PathBuf,
    /// Directory under `cgroup_root` holding one group per container.
    pub cgroup_parent: String,
    /// Upper bound on each wait for the container process, in milliseconds.
    pub handoff_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL on stop, in milliseconds.
    pub stop_grace_ms: u64,
    /// Explicit path to the `ip` binary; looked up on `PATH` when unset.
    pub ip_binary: Option<PathBuf>,
    /// Explicit path to the `nsenter` binary; looked up on `PATH` when unset.
    pub nsenter_binary: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            cgroup_parent: constants::DEFAULT_CGROUP_PARENT.to_string(),
            handoff_timeout_ms: constants::DEFAULT_HANDOFF_TIMEOUT_MS,
            stop_grace_ms: constants::DEFAULT_STOP_GRACE_MS,
            ip_binary: None,
            nsenter_binary: None,
        }
    }
}

impl RuntimeConfig {
    /// Returns the handoff timeout as a [`Duration`].
    #[must_use]
    pub const fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    /// Returns the stop grace period as a [`Duration`].
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
