//! Lifecycle tests for a single [`Container`] against the recording backend.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;

use common::{Fault, FakeBackend, config};
use skiff_common::error::SkiffError;
use skiff_common::types::ContainerState;
use skiff_runtime::container::Container;

fn container(backend: &Arc<FakeBackend>, root: &std::path::Path, name: &str) -> Container {
    Container::new(config(root, name, 100), Arc::clone(backend) as _).expect("valid config")
}

#[test]
fn start_runs_every_step_in_order() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut c = container(&backend, root.path(), "c1");

    c.start().expect("start");

    assert_eq!(c.state(), ContainerState::Running);
    assert_eq!(
        backend.host.events_of("c1"),
        ["spawn", "attach", "network-ready", "root-switched", "confine", "proceed", "exec"]
    );
    assert!(c.pid().is_some());
    assert!(c.network().is_some());
    assert!(c.cgroup().is_some());
    assert!(c.confinement_error().is_none());
}

#[test]
fn stop_releases_in_reverse_order_and_leaves_bridge() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut c = container(&backend, root.path(), "c1");
    c.start().expect("start");

    c.stop().expect("stop");

    assert_eq!(c.state(), ContainerState::Stopped);
    let events = backend.host.events_of("c1");
    assert_eq!(events[events.len() - 3..], ["terminate", "release", "detach"]);
    assert!(backend.host.veths().is_empty());
    assert!(backend.host.cgroups().is_empty());
    assert!(backend.host.live_processes().is_empty());
    assert!(backend.host.bridges().contains("docker0"));
}

#[test]
fn network_failure_fails_without_cgroup() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default().with_fault("c1", Fault::Network));
    let mut c = container(&backend, root.path(), "c1");

    let err = c.start().unwrap_err();

    assert!(matches!(err, SkiffError::NetworkSetup { .. }), "{err:?}");
    assert_eq!(c.state(), ContainerState::Failed);
    assert_eq!(backend.host.events_of("c1"), ["spawn", "attach", "terminate"]);
    assert!(backend.host.cgroups().is_empty());
    assert!(backend.host.veths().is_empty());
    assert!(backend.host.live_processes().is_empty());
}

#[test]
fn root_switch_failure_tears_down_network() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default().with_fault("c1", Fault::RootSwitch));
    let mut c = container(&backend, root.path(), "c1");

    let err = c.start().unwrap_err();

    assert!(matches!(err, SkiffError::RootSwitch { .. }), "{err:?}");
    assert_eq!(c.state(), ContainerState::Failed);
    let events = backend.host.events_of("c1");
    assert!(!events.contains(&"confine".to_string()));
    assert_eq!(events[events.len() - 2..], ["terminate", "detach"]);
    assert!(backend.host.veths().is_empty());
    assert!(c.network().is_none());
}

#[test]
fn exec_failure_rolls_back_everything() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default().with_fault("c1", Fault::Exec));
    let mut c = container(&backend, root.path(), "c1");

    assert!(c.start().is_err());

    assert_eq!(c.state(), ContainerState::Failed);
    let events = backend.host.events_of("c1");
    assert_eq!(events[events.len() - 3..], ["terminate", "release", "detach"]);
    assert!(backend.host.veths().is_empty());
    assert!(backend.host.cgroups().is_empty());
}

#[test]
fn cgroup_failure_leaves_container_running_degraded() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default().with_fault("c1", Fault::Cgroup));
    let mut c = container(&backend, root.path(), "c1");

    c.start().expect("soft cgroup failure");

    assert_eq!(c.state(), ContainerState::Running);
    assert!(matches!(c.confinement_error(), Some(SkiffError::Cgroup { .. })));
    assert!(c.cgroup().is_none());

    c.stop().expect("stop");
    assert!(!backend.host.events_of("c1").contains(&"release".to_string()));
}

#[test]
fn spawn_failure_touches_nothing_else() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default().with_fault("c1", Fault::Spawn));
    let mut c = container(&backend, root.path(), "c1");

    let err = c.start().unwrap_err();

    assert!(matches!(err, SkiffError::NamespaceCreation { .. }));
    assert_eq!(c.state(), ContainerState::Failed);
    assert_eq!(backend.host.events_of("c1"), ["spawn"]);
}

#[test]
fn teardown_collects_errors_and_keeps_going() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default().with_fault("c1", Fault::Detach));
    let mut c = container(&backend, root.path(), "c1");
    c.start().expect("start");

    let err = c.stop().unwrap_err();

    match err {
        SkiffError::Teardown { errors } => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].starts_with("detach network"));
        }
        other => panic!("expected Teardown, got {other:?}"),
    }
    assert_eq!(c.state(), ContainerState::Stopped);
    assert!(backend.host.cgroups().is_empty());
}

#[test]
fn invalid_config_creates_nothing() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut cfg = config(root.path(), "c1", 100);
    cfg.ip = Ipv4Addr::new(172, 16, 0, 1);

    let err = Container::new(cfg, Arc::clone(&backend) as _).unwrap_err();

    assert!(matches!(err, SkiffError::InvalidConfig { .. }));
    assert!(backend.host.events().is_empty());
}

#[test]
fn cancellation_during_start_rolls_back_to_stopped() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut c = container(&backend, root.path(), "c1");
    backend.cancel_during_attach(c.cancel_flag());

    let err = c.start().unwrap_err();

    assert!(matches!(err, SkiffError::Cancelled { .. }), "{err:?}");
    assert_eq!(c.state(), ContainerState::Stopped);
    assert_eq!(
        backend.host.events_of("c1"),
        ["spawn", "attach", "terminate", "detach"]
    );
    assert!(backend.host.veths().is_empty());
}

#[test]
fn start_is_only_allowed_once() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut c = container(&backend, root.path(), "c1");
    c.start().expect("start");
    c.stop().expect("stop");

    let err = c.start().unwrap_err();

    assert!(matches!(
        err,
        SkiffError::InvalidTransition {
            state: ContainerState::Stopped,
            ..
        }
    ));
}

#[test]
fn stop_on_created_and_terminal_containers() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut c = container(&backend, root.path(), "c1");

    c.stop().expect("stop created");
    assert_eq!(c.state(), ContainerState::Stopped);
    c.stop().expect("stop again");
    assert!(backend.host.events().is_empty());
}

#[test]
fn wait_returns_exit_code_of_started_container() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut c = container(&backend, root.path(), "c1");
    assert!(c.wait().is_err());

    c.start().expect("start");
    assert_eq!(c.wait().expect("wait"), 0);
}

#[test]
fn stop_lets_go_of_the_process_and_keeps_its_exit_code() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    let mut c = container(&backend, root.path(), "c1");
    c.start().expect("start");
    assert_eq!(backend.host.open_handles().len(), 1);

    c.stop().expect("stop");

    assert!(backend.host.open_handles().is_empty());
    assert!(c.pid().is_none());
    assert_eq!(c.wait().expect("exit code survives stop"), 0);
}

#[test]
fn failed_start_lets_go_of_the_process() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default().with_fault("c1", Fault::RootSwitch));
    let mut c = container(&backend, root.path(), "c1");

    assert!(c.start().is_err());

    assert!(backend.host.open_handles().is_empty());
    assert!(c.pid().is_none());
}

#[test]
fn dropping_a_running_container_releases_it() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(FakeBackend::default());
    {
        let mut c = container(&backend, root.path(), "c1");
        c.start().expect("start");
    }
    assert!(backend.host.veths().is_empty());
    assert!(backend.host.cgroups().is_empty());
}
