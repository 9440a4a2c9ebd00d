//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight`, converting cgroup v1 style shares.

use std::path::Path;

use skiff_common::error::Result;

/// Smallest accepted `cpu.weight`.
pub const MIN_WEIGHT: u64 = 1;

/// Largest accepted `cpu.weight`.
pub const MAX_WEIGHT: u64 = 10_000;

/// Converts cgroup v1 CPU shares (2..=262144) to a cgroup v2 weight (1..=10000).
///
/// Uses the same linear mapping as the OCI runtimes.
#[must_use]
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    (1 + ((shares - 2) * 9_999) / 262_142).clamp(MIN_WEIGHT, MAX_WEIGHT)
}

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    let weight = weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
    super::write_control(cgroup_path, "cpu.weight", &weight.to_string())?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}
