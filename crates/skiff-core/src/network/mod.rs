//! Container networking: a veth pair between the host bridge and the
//! container's private network namespace.
//!
//! [`NetworkBridge::attach`] wires a container in five steps: ensure the
//! bridge, create the pair, enslave the host end, move the peer into the
//! container's namespace, and configure it from inside. A failure after the
//! pair exists deletes it again before the error is returned. The bridge is
//! shared and is never removed here.

pub mod bridge;
pub mod command;
pub mod veth;

use std::net::Ipv4Addr;

use skiff_common::config::ContainerConfig;
use skiff_common::constants::CONTAINER_IFNAME;
use skiff_common::error::Result;

pub use self::command::{IpCommand, SystemIp};

/// A container's veth pair, alive for as long as the container runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLink {
    /// Host-side end, enslaved to the bridge.
    pub host_ifname: String,
    /// Name the container-side end had on the host before the move.
    pub peer_ifname: String,
    /// Name of the container-side end inside the namespace.
    pub container_ifname: String,
    /// Bridge the host end is attached to.
    pub bridge_name: String,
    /// Address of the container-side end.
    pub container_ip: Ipv4Addr,
    /// Prefix length of the container subnet.
    pub prefix_len: u8,
}

/// Parameters of one attachment.
#[derive(Debug, Clone, Copy)]
pub struct AttachRequest<'a> {
    /// Container identity the interface names are derived from.
    pub identity: &'a str,
    /// Host bridge to attach to.
    pub bridge_name: &'a str,
    /// Bridge address, the container's gateway.
    pub bridge_ip: Ipv4Addr,
    /// Address for the container interface.
    pub container_ip: Ipv4Addr,
    /// Subnet prefix shared by both addresses.
    pub prefix_len: u8,
}

impl<'a> AttachRequest<'a> {
    /// Builds the request for a container configuration.
    #[must_use]
    pub fn from_config(config: &'a ContainerConfig) -> Self {
        Self {
            identity: &config.host_name,
            bridge_name: &config.bridge_name,
            bridge_ip: config.bridge_ip,
            container_ip: config.ip,
            prefix_len: config.prefix_len,
        }
    }
}

/// Wires containers to host bridges through an [`IpCommand`].
#[derive(Debug, Clone)]
pub struct NetworkBridge<R = SystemIp> {
    runner: R,
}

impl<R: IpCommand> NetworkBridge<R> {
    /// Creates a bridge manager driving `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    /// The command runner in use.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Connects the network namespace of process `pid` to the host bridge.
    ///
    /// # Errors
    ///
    /// Returns [`skiff_common::error::SkiffError::BridgeConflict`] if the
    /// bridge exists with another address, and
    /// [`skiff_common::error::SkiffError::NetworkSetup`] for any other failed
    /// step. No veth pair survives a failed attach.
    pub fn attach(&self, pid: u32, request: &AttachRequest<'_>) -> Result<NetworkLink> {
        let outcome = bridge::ensure_bridge(
            &self.runner,
            request.bridge_name,
            request.bridge_ip,
            request.prefix_len,
        )?;
        tracing::debug!(bridge = request.bridge_name, ?outcome, "bridge ensured");

        let names = veth::veth_names(request.identity);
        veth::create_pair(&self.runner, &names)?;

        let link = NetworkLink {
            host_ifname: names.host,
            peer_ifname: names.peer,
            container_ifname: CONTAINER_IFNAME.to_string(),
            bridge_name: request.bridge_name.to_string(),
            container_ip: request.container_ip,
            prefix_len: request.prefix_len,
        };

        if let Err(e) = self.wire(pid, &link, request.bridge_ip) {
            tracing::warn!(host = %link.host_ifname, error = %e, "network attach failed, rolling back");
            if let Err(rollback) = veth::delete_pair(&self.runner, &link.host_ifname) {
                tracing::warn!(host = %link.host_ifname, error = %rollback, "veth rollback failed");
            }
            return Err(e);
        }

        tracing::info!(
            pid,
            host = %link.host_ifname,
            bridge = %link.bridge_name,
            ip = %link.container_ip,
            "container network attached"
        );
        Ok(link)
    }

    /// Deletes the container's veth pair.
    ///
    /// A pair that is already gone (it disappears with its namespace when
    /// the container exits) counts as success.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair exists but cannot be deleted.
    pub fn detach(&self, link: &NetworkLink) -> Result<()> {
        let _ = veth::delete_pair(&self.runner, &link.host_ifname)?;
        Ok(())
    }

    fn wire(&self, pid: u32, link: &NetworkLink, gateway: Ipv4Addr) -> Result<()> {
        veth::attach_to_bridge(&self.runner, &link.host_ifname, &link.bridge_name)?;
        veth::move_to_netns(&self.runner, &link.peer_ifname, pid)?;
        veth::configure_container_side(
            &self.runner,
            pid,
            &link.peer_ifname,
            link.container_ip,
            link.prefix_len,
            gateway,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::command::scripted::ScriptedIp;
    use super::*;
    use skiff_common::error::SkiffError;

    const DOCKER0: &str = r#"[{"ifname":"docker0","linkinfo":{"info_kind":"bridge"},
        "addr_info":[{"family":"inet","local":"172.16.0.1","prefixlen":24}]}]"#;

    fn request() -> AttachRequest<'static> {
        AttachRequest {
            identity: "c1",
            bridge_name: "docker0",
            bridge_ip: Ipv4Addr::new(172, 16, 0, 1),
            container_ip: Ipv4Addr::new(172, 16, 0, 100),
            prefix_len: 24,
        }
    }

    #[test]
    fn attach_runs_steps_in_order() {
        let ip = ScriptedIp::default().ok("ip -j -d addr show", DOCKER0);
        let bridge = NetworkBridge::new(ip);
        let link = bridge.attach(500, &request()).expect("attach");
        let names = veth::veth_names("c1");

        assert_eq!(link.host_ifname, names.host);
        assert_eq!(link.container_ifname, "eth0");

        let calls = bridge.runner.calls();
        let position = |needle: &str| {
            calls
                .iter()
                .position(|c| c.contains(needle))
                .unwrap_or_else(|| panic!("missing {needle} in {calls:?}"))
        };
        assert!(position("type veth") < position("master docker0"));
        assert!(position("master docker0") < position("netns 500"));
        assert!(position("netns 500") < position("--net -- ip link set dev"));
        assert!(!calls.iter().any(|c| c.contains("link delete")));
    }

    #[test]
    fn failure_inside_namespace_deletes_the_pair() {
        let ip = ScriptedIp::default()
            .ok("ip -j -d addr show", DOCKER0)
            .fail("nsenter --target=500 --net -- ip addr add", "RTNETLINK answers: Permission denied");
        let bridge = NetworkBridge::new(ip);
        let err = bridge.attach(500, &request()).unwrap_err();
        assert!(matches!(
            err,
            SkiffError::NetworkSetup {
                step: "assign container address",
                ..
            }
        ));

        let host = veth::veth_names("c1").host;
        let calls = bridge.runner.calls();
        assert_eq!(calls.last(), Some(&format!("ip link delete dev {host}")));
        assert!(!calls.iter().any(|c| c.contains("link delete dev docker0")));
    }

    #[test]
    fn failed_pair_creation_has_nothing_to_roll_back() {
        let ip = ScriptedIp::default()
            .ok("ip -j -d addr show", DOCKER0)
            .fail("ip link add skh", "RTNETLINK answers: File exists");
        let bridge = NetworkBridge::new(ip);
        assert!(bridge.attach(500, &request()).is_err());
        assert!(!bridge.runner.calls().iter().any(|c| c.contains("link delete")));
    }

    #[test]
    fn bridge_conflict_stops_before_any_veth() {
        let other = DOCKER0.replace("172.16.0.1", "10.1.0.1");
        let ip = ScriptedIp::default().ok("ip -j -d addr show", &other);
        let bridge = NetworkBridge::new(ip);
        let err = bridge.attach(500, &request()).unwrap_err();
        assert!(matches!(err, SkiffError::BridgeConflict { .. }));
        assert_eq!(bridge.runner.calls().len(), 1);
    }

    #[test]
    fn detach_tolerates_vanished_pair() {
        let ip = ScriptedIp::default().fail("ip link delete", "Cannot find device \"skh\"");
        let bridge = NetworkBridge::new(ip);
        let link = NetworkLink {
            host_ifname: "skh12345678".into(),
            peer_ifname: "skc12345678".into(),
            container_ifname: "eth0".into(),
            bridge_name: "docker0".into(),
            container_ip: Ipv4Addr::new(172, 16, 0, 100),
            prefix_len: 24,
        };
        bridge.detach(&link).expect("idempotent detach");
    }
}
