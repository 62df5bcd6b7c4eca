//! Aggregate statistics collected from the v1 subsystems.
//!
//! One [`Stats`] value is shared across all subsystem collectors; each
//! collector fills in its own section.

use serde::{Deserialize, Serialize};

/// Statistics for one managed cgroup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub pids: PidsStats,
    pub blkio: BlkioStats,
}

/// Counters from the memory subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Current usage in bytes.
    pub usage: u64,
    /// High-water mark in bytes.
    pub max_usage: u64,
    /// Configured limit in bytes.
    pub limit: u64,
    /// Number of times the limit was hit.
    pub failcnt: u64,
}

/// Counters from the cpuacct and cpu subsystems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    /// Total CPU time consumed, nanoseconds.
    pub usage_total: u64,
    /// User-mode time in USER_HZ ticks.
    pub usage_user: u64,
    /// Kernel-mode time in USER_HZ ticks.
    pub usage_system: u64,
    /// Number of enforcement periods that elapsed.
    pub nr_periods: u64,
    /// Number of times the group was throttled.
    pub nr_throttled: u64,
    /// Total time spent throttled, nanoseconds.
    pub throttled_time: u64,
}

/// Counters from the pids subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsStats {
    /// Number of pids currently in the group.
    pub current: u64,
    /// Configured limit; 0 means unlimited.
    pub limit: u64,
}

/// Counters from the blkio subsystem (throttle totals).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlkioStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
}
