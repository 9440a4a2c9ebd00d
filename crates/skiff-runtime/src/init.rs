//! Container-side init: everything the cloned process does before it
//! becomes the entry point.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use skiff_common::config::ContainerConfig;
use skiff_common::constants::DEFAULT_PATH_ENV;
use skiff_core::filesystem;
use skiff_core::namespace::{NamespaceConfig, uts};

use crate::handoff::{HandoffChannel, HandoffMessage, SetupStage};

/// Exit status when setup fails before exec.
const SETUP_FAILED: isize = 1;

/// Exit status when the entry point cannot be executed.
const EXEC_FAILED: isize = 127;

type StepResult = std::result::Result<(), (SetupStage, String)>;

/// Body of the cloned container process.
///
/// Only returns if something failed; on success the process image is
/// replaced by the entry point. The hostname and root are only changed in
/// namespaces the process was cloned into, never the host's.
pub(crate) fn container_main(
    channel: &mut HandoffChannel,
    config: &ContainerConfig,
    namespaces: &NamespaceConfig,
    timeout: Duration,
) -> isize {
    close_inherited_fds(&channel.raw_fds());

    if let Err((stage, message)) = prepare(channel, config, namespaces, timeout) {
        report(channel, stage, message);
        return SETUP_FAILED;
    }

    let message = exec_entrypoint(config);
    report(channel, SetupStage::Exec, message);
    EXEC_FAILED
}

fn prepare(
    channel: &mut HandoffChannel,
    config: &ContainerConfig,
    namespaces: &NamespaceConfig,
    timeout: Duration,
) -> StepResult {
    expect(channel, timeout, &HandoffMessage::NetworkReady)?;
    if namespaces.uts {
        uts::set_hostname(&config.host_name).map_err(|e| (SetupStage::Hostname, e.to_string()))?;
    }
    if namespaces.mount {
        filesystem::switch_root(&config.root_dir)
            .map_err(|e| (SetupStage::RootSwitch, e.to_string()))?;
    }
    channel
        .send(&HandoffMessage::RootSwitched)
        .map_err(|e| (SetupStage::Handoff, e.to_string()))?;
    expect(channel, timeout, &HandoffMessage::Proceed)
}

fn expect(channel: &mut HandoffChannel, timeout: Duration, wanted: &HandoffMessage) -> StepResult {
    match channel.recv(timeout) {
        Ok(Some(ref message)) if message == wanted => Ok(()),
        Ok(Some(other)) => Err((SetupStage::Handoff, format!("expected {wanted:?}, got {other:?}"))),
        Ok(None) => Err((SetupStage::Handoff, "supervisor went away".into())),
        Err(e) => Err((SetupStage::Handoff, e.to_string())),
    }
}

fn report(channel: &mut HandoffChannel, stage: SetupStage, message: String) {
    // The supervisor may already be gone; nothing else to tell.
    let _ = channel.send(&HandoffMessage::Failed { stage, message });
}

/// Closes every descriptor above stderr except `keep`.
///
/// The clone copied the supervisor's whole descriptor table, including its
/// ends of this container's channel and those of containers being started
/// concurrently.
fn close_inherited_fds(keep: &[RawFd]) {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    let fds: Vec<RawFd> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .filter(|fd| *fd > 2 && !keep.contains(fd))
        .collect();
    for fd in fds {
        // SAFETY: this process is a fresh clone running only this function;
        // no live object owns the inherited descriptor.
        let _ = unsafe { libc::close(fd) };
    }
}

/// Replaces the process with the entry point; returns only on failure.
fn exec_entrypoint(config: &ContainerConfig) -> String {
    let env = build_env(config);
    let path_var = env
        .iter()
        .find(|(key, _)| key == "PATH")
        .map_or(DEFAULT_PATH_ENV, |(_, value)| value.as_str());

    let Some(program) = config.entrypoint.first() else {
        return "empty entrypoint".into();
    };
    let Some(resolved) = resolve_program(program, path_var) else {
        return format!("{program}: not found in {path_var}");
    };

    let cstrings = |items: Vec<String>| -> std::result::Result<Vec<CString>, String> {
        items
            .into_iter()
            .map(|item| CString::new(item).map_err(|e| e.to_string()))
            .collect()
    };
    let path = match CString::new(resolved.as_os_str().as_encoded_bytes()) {
        Ok(path) => path,
        Err(e) => return e.to_string(),
    };
    let argv = match cstrings(config.entrypoint.clone()) {
        Ok(argv) => argv,
        Err(e) => return e,
    };
    let envp = match cstrings(env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()) {
        Ok(envp) => envp,
        Err(e) => return e,
    };

    match nix::unistd::execve(&path, &argv, &envp) {
        Ok(never) => match never {},
        Err(e) => format!("execve {}: {e}", resolved.display()),
    }
}

/// Environment of the entry point: `PATH` and `HOSTNAME`, overridable, then
/// the configured variables in order.
pub(crate) fn build_env(config: &ContainerConfig) -> Vec<(String, String)> {
    let mut env = vec![
        ("PATH".to_string(), DEFAULT_PATH_ENV.to_string()),
        ("HOSTNAME".to_string(), config.host_name.clone()),
    ];
    for (key, value) in &config.env {
        match env.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1.clone_from(value),
            None => env.push((key.clone(), value.clone())),
        }
    }
    env
}

/// Finds `program` the way a shell would: as given if it contains a `/`,
/// otherwise in the first `path_var` directory holding an executable file.
pub(crate) fn resolve_program(program: &str, path_var: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    path_var
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}
