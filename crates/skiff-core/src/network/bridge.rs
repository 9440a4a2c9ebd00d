//! Host bridge management.
//!
//! Bridges are shared between containers: they are created on first use,
//! reused afterwards, and never deleted by a container's lifecycle.

use std::net::Ipv4Addr;

use serde::Deserialize;
use skiff_common::error::{Result, SkiffError};

use super::command::{IpCommand, is_missing_device};

/// What the host currently has under a bridge's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeState {
    /// `linkinfo.info_kind` of the device (`bridge` for a bridge).
    pub kind: Option<String>,
    /// IPv4 addresses with their prefix lengths.
    pub ipv4: Vec<(Ipv4Addr, u8)>,
}

/// Result of [`ensure_bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The bridge did not exist and was created.
    Created,
    /// An existing bridge with a matching address was reused.
    Reused,
}

#[derive(Debug, Deserialize)]
struct LinkRecord {
    #[serde(default)]
    linkinfo: Option<LinkInfo>,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

/// Parses the output of `ip -j -d addr show dev <name>`.
///
/// # Errors
///
/// Returns an error if the output is not the expected JSON.
pub fn parse_bridge_state(json: &str) -> Result<Option<BridgeState>> {
    let records: Vec<LinkRecord> = serde_json::from_str(json)?;
    Ok(records.into_iter().next().map(|record| BridgeState {
        kind: record.linkinfo.and_then(|info| info.info_kind),
        ipv4: record
            .addr_info
            .iter()
            .filter(|addr| addr.family == "inet")
            .filter_map(|addr| Some((addr.local.parse().ok()?, addr.prefixlen)))
            .collect(),
    }))
}

/// Looks up a device by name; `None` when it does not exist.
///
/// # Errors
///
/// Returns an error if `ip` fails for another reason or prints unexpected output.
pub fn query_bridge(runner: &dyn IpCommand, name: &str) -> Result<Option<BridgeState>> {
    match runner.run(None, &["-j", "-d", "addr", "show", "dev", name]) {
        Ok(json) => parse_bridge_state(&json),
        Err(e) if is_missing_device(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Makes sure bridge `name` exists, carries `ip/prefix_len`, and is up.
///
/// An absent bridge is created. A concurrent creator winning the race for
/// the device or its address is tolerated by querying again.
///
/// # Errors
///
/// Returns [`SkiffError::BridgeConflict`] if the device exists but is not a
/// bridge or carries a different IPv4 address, and
/// [`SkiffError::NetworkSetup`] if an `ip` command fails.
pub fn ensure_bridge(
    runner: &dyn IpCommand,
    name: &str,
    ip: Ipv4Addr,
    prefix_len: u8,
) -> Result<BridgeOutcome> {
    let (state, outcome) = if let Some(state) = query_bridge(runner, name).map_err(step("query bridge"))? {
        (state, BridgeOutcome::Reused)
    } else {
        (create_bridge(runner, name)?, BridgeOutcome::Created)
    };

    if needs_address(name, &state, ip, prefix_len)? {
        assign_address(runner, name, ip, prefix_len)?;
    }

    let _ = runner
        .run(None, &["link", "set", "dev", name, "up"])
        .map_err(step("bring bridge up"))?;
    tracing::debug!(bridge = name, ?outcome, "bridge ready");
    Ok(outcome)
}

fn create_bridge(runner: &dyn IpCommand, name: &str) -> Result<BridgeState> {
    match runner.run(None, &["link", "add", "name", name, "type", "bridge"]) {
        Ok(_) => {
            tracing::info!(bridge = name, "bridge created");
            Ok(BridgeState {
                kind: Some("bridge".into()),
                ipv4: Vec::new(),
            })
        }
        Err(e) => query_bridge(runner, name)
            .ok()
            .flatten()
            .inspect(|_| tracing::debug!(bridge = name, "bridge created concurrently"))
            .ok_or_else(|| step("create bridge")(e)),
    }
}

/// Adds `ip/prefix_len` to the bridge. If that fails, the bridge is queried
/// again and accepted when a concurrent start already added the same
/// address; `ip` reports that race with messages that vary by version.
fn assign_address(runner: &dyn IpCommand, name: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
    let cidr = format!("{ip}/{prefix_len}");
    let Err(e) = runner.run(None, &["addr", "add", &cidr, "dev", name]) else {
        tracing::info!(bridge = name, %cidr, "bridge address assigned");
        return Ok(());
    };
    match query_bridge(runner, name) {
        Ok(Some(state)) if !state.ipv4.is_empty() => {
            let _ = needs_address(name, &state, ip, prefix_len)?;
            tracing::debug!(bridge = name, %cidr, "bridge address added concurrently");
            Ok(())
        }
        _ => Err(step("assign bridge address")(e)),
    }
}

/// Checks an existing bridge against the request; `true` if it has no IPv4 yet.
fn needs_address(name: &str, state: &BridgeState, ip: Ipv4Addr, prefix_len: u8) -> Result<bool> {
    if state.kind.as_deref() != Some("bridge") {
        return Err(SkiffError::BridgeConflict {
            bridge: name.to_string(),
            expected: "a bridge device".into(),
            found: format!("device of kind {}", state.kind.as_deref().unwrap_or("unknown")),
        });
    }
    if state.ipv4.is_empty() {
        return Ok(true);
    }
    if state.ipv4.contains(&(ip, prefix_len)) {
        return Ok(false);
    }
    Err(SkiffError::BridgeConflict {
        bridge: name.to_string(),
        expected: format!("{ip}/{prefix_len}"),
        found: state
            .ipv4
            .iter()
            .map(|(addr, prefix)| format!("{addr}/{prefix}"))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Wraps a command failure as a [`SkiffError::NetworkSetup`] for `step`.
pub(crate) fn step(step: &'static str) -> impl Fn(SkiffError) -> SkiffError {
    move |e| match e {
        SkiffError::NetworkSetup { .. } | SkiffError::BridgeConflict { .. } => e,
        other => SkiffError::NetworkSetup {
            step,
            message: other.to_string(),
        },
    }
}
