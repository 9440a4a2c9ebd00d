//! Virtual ethernet pair management.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};
use skiff_common::constants::{
    CONTAINER_IFNAME, VETH_HOST_PREFIX, VETH_PEER_PREFIX, VETH_SUFFIX_LEN,
};
use skiff_common::error::Result;

use super::bridge::step;
use super::command::{IpCommand, is_missing_device};

/// Interface names of a container's veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethNames {
    /// End that stays on the host and joins the bridge.
    pub host: String,
    /// End that is moved into the container (renamed to `eth0` there).
    pub peer: String,
}

/// Derives the pair's names from the container identity.
///
/// The same identity always yields the same names, different identities
/// yield different names with overwhelming probability, and every name fits
/// in `IFNAMSIZ`.
#[must_use]
pub fn veth_names(identity: &str) -> VethNames {
    let digest = Sha256::digest(identity.as_bytes());
    let mut suffix = String::with_capacity(VETH_SUFFIX_LEN);
    for byte in digest.iter().take(VETH_SUFFIX_LEN / 2) {
        let _ = write!(suffix, "{byte:02x}");
    }
    VethNames {
        host: format!("{VETH_HOST_PREFIX}{suffix}"),
        peer: format!("{VETH_PEER_PREFIX}{suffix}"),
    }
}

/// Creates the veth pair on the host.
///
/// # Errors
///
/// Returns an error if either name is taken or the kernel refuses the pair.
pub fn create_pair(runner: &dyn IpCommand, names: &VethNames) -> Result<()> {
    let _ = runner
        .run(
            None,
            &["link", "add", &names.host, "type", "veth", "peer", "name", &names.peer],
        )
        .map_err(step("create veth pair"))?;
    tracing::info!(host = %names.host, peer = %names.peer, "veth pair created");
    Ok(())
}

/// Enslaves the host end to `bridge` and brings it up.
///
/// # Errors
///
/// Returns an error if either `ip` command fails.
pub fn attach_to_bridge(runner: &dyn IpCommand, host: &str, bridge: &str) -> Result<()> {
    let _ = runner
        .run(None, &["link", "set", "dev", host, "master", bridge])
        .map_err(step("attach to bridge"))?;
    let _ = runner
        .run(None, &["link", "set", "dev", host, "up"])
        .map_err(step("bring host end up"))?;
    tracing::debug!(host, bridge, "host end attached to bridge");
    Ok(())
}

/// Moves `peer` into the network namespace of process `pid`.
///
/// # Errors
///
/// Returns an error if the interface cannot be moved.
pub fn move_to_netns(runner: &dyn IpCommand, peer: &str, pid: u32) -> Result<()> {
    let pid_arg = pid.to_string();
    let _ = runner
        .run(None, &["link", "set", "dev", peer, "netns", &pid_arg])
        .map_err(step("move peer into namespace"))?;
    tracing::debug!(peer, pid, "peer moved into container namespace");
    Ok(())
}

/// Configures the moved peer from inside the container's network namespace.
///
/// Renames it to `eth0`, assigns `ip/prefix_len`, brings up `lo` and `eth0`,
/// and routes everything through `gateway`.
///
/// # Errors
///
/// Returns an error naming the first step that failed.
pub fn configure_container_side(
    runner: &dyn IpCommand,
    pid: u32,
    peer: &str,
    ip: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
) -> Result<()> {
    let cidr = format!("{ip}/{prefix_len}");
    let gateway = gateway.to_string();
    let ns = Some(pid);

    let _ = runner
        .run(ns, &["link", "set", "dev", peer, "name", CONTAINER_IFNAME])
        .map_err(step("rename container interface"))?;
    let _ = runner
        .run(ns, &["addr", "add", &cidr, "dev", CONTAINER_IFNAME])
        .map_err(step("assign container address"))?;
    let _ = runner
        .run(ns, &["link", "set", "dev", "lo", "up"])
        .map_err(step("bring loopback up"))?;
    let _ = runner
        .run(ns, &["link", "set", "dev", CONTAINER_IFNAME, "up"])
        .map_err(step("bring container interface up"))?;
    let _ = runner
        .run(ns, &["route", "add", "default", "via", &gateway, "dev", CONTAINER_IFNAME])
        .map_err(step("install default route"))?;

    tracing::info!(pid, %cidr, %gateway, "container interface configured");
    Ok(())
}

/// Deletes the pair through its host end.
///
/// Removing the host end also removes its bridge port and the peer,
/// wherever the peer lives. Returns `false` if the host end was already gone.
///
/// # Errors
///
/// Returns an error if the interface exists but cannot be deleted.
pub fn delete_pair(runner: &dyn IpCommand, host: &str) -> Result<bool> {
    match runner.run(None, &["link", "delete", "dev", host]) {
        Ok(_) => {
            tracing::info!(host, "veth pair deleted");
            Ok(true)
        }
        Err(e) if is_missing_device(&e) => {
            tracing::debug!(host, "veth pair already gone");
            Ok(false)
        }
        Err(e) => Err(step("delete veth pair")(e)),
    }
}
