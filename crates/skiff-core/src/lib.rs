//! # skiff-core
//!
//! Low-level Linux isolation primitives for the skiff runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: cloning a process into new UTS, mount, PID, network and IPC namespaces.
//! - **Networking**: host bridge management and veth pairs wired into a container's namespace.
//! - **Filesystem**: pseudo-filesystem mounts and `pivot_root`.
//! - **Cgroups v2**: CPU and memory limits for the container process.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod network;
