//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname and domain name.

use skiff_common::error::{Result, SkiffError};

/// Sets the hostname inside the caller's UTS namespace.
///
/// Must run inside the container process; in the host's UTS namespace this
/// would rename the host.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| SkiffError::NamespaceCreation {
        message: format!("sethostname({hostname}) failed: {e}"),
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> Result<()> {
    Err(SkiffError::NamespaceCreation {
        message: "Linux required for native container operations".into(),
    })
}
