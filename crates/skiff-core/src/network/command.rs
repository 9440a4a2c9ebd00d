//! Execution of `ip(8)` commands on the host or inside a container's
//! network namespace.

use std::path::PathBuf;
use std::process::Command;

use skiff_common::error::{Result, SkiffError};

/// Runs `ip` subcommands.
///
/// Implementations must be callable from several supervisor threads at once.
pub trait IpCommand: Send + Sync {
    /// Runs `ip <args>` and returns its standard output.
    ///
    /// With `netns_pid`, the command runs inside the network namespace of
    /// that process instead of the host's.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::CommandFailed`] if the command exits unsuccessfully.
    fn run(&self, netns_pid: Option<u32>, args: &[&str]) -> Result<String>;
}

/// [`IpCommand`] backed by the host's `ip` and `nsenter` binaries.
#[derive(Debug, Clone)]
pub struct SystemIp {
    ip: PathBuf,
    nsenter: PathBuf,
}

impl SystemIp {
    /// Uses the given binaries, looking up any that are `None` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] if a binary cannot be located.
    pub fn new(ip: Option<PathBuf>, nsenter: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            ip: resolve(ip, "ip")?,
            nsenter: resolve(nsenter, "nsenter")?,
        })
    }

    /// Locates both binaries on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NotFound`] if a binary cannot be located.
    pub fn discover() -> Result<Self> {
        Self::new(None, None)
    }
}

fn resolve(explicit: Option<PathBuf>, name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => which::which(name).map_err(|_| SkiffError::NotFound {
            kind: "binary",
            id: name.to_string(),
        }),
    }
}

impl IpCommand for SystemIp {
    fn run(&self, netns_pid: Option<u32>, args: &[&str]) -> Result<String> {
        let mut cmd = if let Some(pid) = netns_pid {
            let mut cmd = Command::new(&self.nsenter);
            let _ = cmd
                .arg(format!("--target={pid}"))
                .arg("--net")
                .arg("--")
                .arg(&self.ip);
            cmd
        } else {
            Command::new(&self.ip)
        };
        let _ = cmd.args(args);

        let rendered = render(netns_pid, args);
        tracing::debug!(command = %rendered, "running ip command");
        let output = cmd.output().map_err(|e| SkiffError::Io {
            path: self.ip.clone(),
            source: e,
        })?;

        if !output.status.success() {
            return Err(SkiffError::CommandFailed {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Human-readable form of an `ip` invocation, used in logs and errors.
pub(crate) fn render(netns_pid: Option<u32>, args: &[&str]) -> String {
    let base = format!("ip {}", args.join(" "));
    match netns_pid {
        Some(pid) => format!("nsenter --target={pid} --net -- {base}"),
        None => base,
    }
}

/// Returns `true` if the error says the named device does not exist.
pub(crate) fn is_missing_device(err: &SkiffError) -> bool {
    matches!(err, SkiffError::CommandFailed { stderr, .. }
        if stderr.contains("does not exist") || stderr.contains("Cannot find device"))
}
