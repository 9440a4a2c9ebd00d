//! System-wide constants and default values.

/// Application name used for cgroup parents and interface prefixes.
pub const APP_NAME: &str = "skiff";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Directory under the cgroup root that holds one group per container.
pub const DEFAULT_CGROUP_PARENT: &str = APP_NAME;

/// Kernel limit on hostname length (`HOST_NAME_MAX`).
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Kernel limit on interface name length, excluding the NUL (`IFNAMSIZ - 1`).
pub const MAX_IFNAME_LEN: usize = 15;

/// Prefix of the host-side end of a container's veth pair.
pub const VETH_HOST_PREFIX: &str = "skh";

/// Prefix of the container-side end of a veth pair before it is renamed.
pub const VETH_PEER_PREFIX: &str = "skc";

/// Number of hex digits of the identity digest used in veth names.
pub const VETH_SUFFIX_LEN: usize = 8;

/// Name of the container interface once it is inside the network namespace.
pub const CONTAINER_IFNAME: &str = "eth0";

/// Subnet prefix used when the configuration does not specify one.
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Smallest accepted subnet prefix.
pub const MIN_PREFIX_LEN: u8 = 8;

/// Largest accepted subnet prefix (leaves room for two host addresses).
pub const MAX_PREFIX_LEN: u8 = 30;

/// Entry point executed when the configuration does not name one.
pub const DEFAULT_ENTRYPOINT: &str = "/bin/sh";

/// `PATH` exported to the container entry point.
pub const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default memory ceiling (256 MiB).
pub const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Default CPU shares (the cgroup v1 neutral weight).
pub const DEFAULT_CPU_SHARES: u64 = 1024;

/// Upper bound on a single wait on the supervisor/container handoff channel.
pub const DEFAULT_HANDOFF_TIMEOUT_MS: u64 = 10_000;

/// Time a container gets to exit after SIGTERM before it is killed.
///
/// The entry point is PID 1 of its namespace, so the kernel drops SIGTERM
/// unless it installed a handler. Such an entry point is only killed once
/// this period has passed.
pub const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

/// Stack size handed to `clone(2)` for the container init.
pub const CLONE_STACK_SIZE: usize = 1024 * 1024;
