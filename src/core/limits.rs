//! Resource intent to cgroup controller values.

use crate::config::types::{EnvError, ResourceLimits, Result};
use crate::kernel::cgroup::{ControllerParams, IoThrottle};
use serde::{Deserialize, Serialize};

/// CFS period used for every quota, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;
/// Lowest value the kernel accepts for v1 `cpu.shares`.
pub const MIN_CPU_SHARES: u64 = 2;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Resources the host can hand out, in the same units as [`ResourceLimits`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub total_memory_mb: u64,
    /// Online cores x 100
    pub total_cpu_percent: u32,
}

/// Reject limits that are zero or larger than the host.
pub fn validate(limits: &ResourceLimits, capacity: &HostCapacity) -> Result<()> {
    if limits.cpu_percent == 0 {
        return Err(EnvError::InvalidLimits("cpu_percent must be greater than 0".to_string()));
    }
    if limits.memory_mb == 0 {
        return Err(EnvError::InvalidLimits("memory_mb must be greater than 0".to_string()));
    }
    if limits.memory_mb > capacity.total_memory_mb {
        return Err(EnvError::ResourceLimitExceeded(format!(
            "memory {} MB exceeds host total {} MB",
            limits.memory_mb, capacity.total_memory_mb
        )));
    }
    if limits.cpu_percent > capacity.total_cpu_percent {
        return Err(EnvError::ResourceLimitExceeded(format!(
            "cpu {}% exceeds host total {}%",
            limits.cpu_percent, capacity.total_cpu_percent
        )));
    }
    Ok(())
}

/// Validate `limits` and derive the controller values for both hierarchies.
pub fn translate(
    limits: &ResourceLimits,
    capacity: &HostCapacity,
    io_device: &str,
) -> Result<ControllerParams> {
    validate(limits, capacity)?;

    let cpu_percent = u64::from(limits.cpu_percent);
    let memory_max_bytes = limits.memory_mb * BYTES_PER_MB;
    let io = match limits.io_throttle() {
        Some(mbps) => Some(IoThrottle {
            device: io_device.to_string(),
            bytes_per_sec: mbps.checked_mul(BYTES_PER_MB).ok_or_else(|| {
                EnvError::InvalidLimits(format!("io_mbps {} is out of range", mbps))
            })?,
        }),
        None => None,
    };

    Ok(ControllerParams {
        cpu_quota_us: cpu_percent * CPU_PERIOD_US / 100,
        cpu_period_us: CPU_PERIOD_US,
        cpu_shares: (cpu_percent * 1024 / 100).max(MIN_CPU_SHARES),
        memory_max_bytes,
        memory_high_bytes: memory_max_bytes * 9 / 10,
        io,
    })
}

/// Sum of the limits held by live environments against host capacity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub environments: usize,
    pub cpu_percent: u64,
    pub memory_mb: u64,
    pub capacity: HostCapacity,
}

impl Allocation {
    pub fn from_limits<'a, I>(limits: I, capacity: HostCapacity) -> Self
    where
        I: IntoIterator<Item = &'a ResourceLimits>,
    {
        let mut allocation = Allocation {
            environments: 0,
            cpu_percent: 0,
            memory_mb: 0,
            capacity,
        };
        for l in limits {
            allocation.environments += 1;
            allocation.cpu_percent += u64::from(l.cpu_percent);
            allocation.memory_mb += l.memory_mb;
        }
        allocation
    }

    pub fn available_memory_mb(&self) -> u64 {
        self.capacity.total_memory_mb.saturating_sub(self.memory_mb)
    }

    pub fn available_cpu_percent(&self) -> u64 {
        u64::from(self.capacity.total_cpu_percent).saturating_sub(self.cpu_percent)
    }

    /// Check that `limits` still fit next to what is already allocated.
    pub fn admit(&self, limits: &ResourceLimits) -> Result<()> {
        if limits.memory_mb > self.available_memory_mb() {
            return Err(EnvError::ResourceLimitExceeded(format!(
                "memory {} MB exceeds remaining {} MB",
                limits.memory_mb,
                self.available_memory_mb()
            )));
        }
        if u64::from(limits.cpu_percent) > self.available_cpu_percent() {
            return Err(EnvError::ResourceLimitExceeded(format!(
                "cpu {}% exceeds remaining {}%",
                limits.cpu_percent,
                self.available_cpu_percent()
            )));
        }
        Ok(())
    }
}
