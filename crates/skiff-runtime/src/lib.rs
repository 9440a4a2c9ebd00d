//! Container lifecycle management for the skiff runtime.
//!
//! A container is started by two cooperating processes. The supervisor (this
//! crate, running in the caller) spawns the container process into fresh
//! namespaces, wires its network, confines it in a cgroup, and tells it when
//! to proceed. The container process waits on the [`handoff`] channel at each
//! step, switches its root, and finally executes the entry point.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod backend;
pub mod container;
pub mod engine;
pub mod handoff;
mod init;
