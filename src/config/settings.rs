/// Runtime configuration loading and host detection
use crate::config::types::{EnvError, Result};
use crate::core::limits::HostCapacity;
use crate::kernel::cgroup::backend::{detect_generation, ControllerGeneration};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deployment-level configuration, typically read from a JSON file.
///
/// Fields left out of the file take their defaults; `generation` and the
/// host totals are detected by [`RuntimeConfig::resolve`] when absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding one sub-directory per environment
    pub base_dir: PathBuf,
    /// Mount point of the cgroup filesystem
    pub cgroup_root: PathBuf,
    /// Prefix prepended to environment names to form cgroup node names
    pub cgroup_prefix: String,
    /// Controller generation override (detected when absent)
    pub generation: Option<ControllerGeneration>,
    /// Host memory available to environments, in MiB (detected when absent)
    pub host_total_memory_mb: Option<u64>,
    /// Host CPU capacity in percent of one core (detected when absent)
    pub host_total_cpu_percent: Option<u32>,
    /// Block device (`major:minor`) used for I/O throttling
    pub io_device: String,
    /// Command prefix used to gain privilege (empty when already root)
    pub privilege_wrapper: Vec<String>,
    /// `user:group` given ownership of environment files (`None` skips chown)
    pub owner: Option<String>,
    pub dir_mode: u32,
    pub file_mode: u32,
    /// Namespace hostname is this prefix followed by the environment name
    pub hostname_prefix: String,
    pub settle_delay_ms: u64,
    pub kill_grace_ms: u64,
    pub post_kill_wait_ms: u64,
    pub exec_timeout_secs: u64,
    pub detach_timeout_secs: u64,
    /// Visible process count below which a namespace is considered isolated
    pub isolation_threshold: usize,
    /// Log substrings that mark a dead environment as failed
    pub failure_markers: Vec<String>,
    /// Directory for per-log lock files
    pub lock_dir: PathBuf,
    /// Reject requests whose sum with existing live allocations exceeds the host
    pub enforce_aggregate_capacity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/cloudenv/environments"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_prefix: "cloudenv_".to_string(),
            generation: None,
            host_total_memory_mb: None,
            host_total_cpu_percent: None,
            io_device: "8:0".to_string(),
            privilege_wrapper: vec!["sudo".to_string(), "-n".to_string()],
            owner: Some("www-data:www-data".to_string()),
            dir_mode: 0o755,
            file_mode: 0o644,
            hostname_prefix: "env-".to_string(),
            settle_delay_ms: 3000,
            kill_grace_ms: 2000,
            post_kill_wait_ms: 1000,
            exec_timeout_secs: 300,
            detach_timeout_secs: 5,
            isolation_threshold: 10,
            failure_markers: vec!["Traceback".to_string(), "Error".to_string()],
            lock_dir: std::env::temp_dir().join("cloudenv-locks"),
            enforce_aggregate_capacity: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EnvError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            EnvError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Fill in detected values and validate.
    pub fn resolve(self) -> Result<ResolvedConfig> {
        if !self.base_dir.is_absolute() {
            return Err(EnvError::Config(format!(
                "base_dir must be absolute: {}",
                self.base_dir.display()
            )));
        }
        if self.cgroup_prefix.contains('/') {
            return Err(EnvError::Config(
                "cgroup_prefix must not contain '/'".to_string(),
            ));
        }
        if !is_device_id(&self.io_device) {
            return Err(EnvError::Config(format!(
                "io_device must be major:minor, got '{}'",
                self.io_device
            )));
        }

        let generation = match self.generation {
            Some(generation) => generation,
            None => detect_generation(&self.cgroup_root).ok_or_else(|| {
                EnvError::Config(format!(
                    "No cgroup hierarchy detected under {}",
                    self.cgroup_root.display()
                ))
            })?,
        };

        let total_memory_mb = match self.host_total_memory_mb {
            Some(mb) => mb,
            None => detect_total_memory_mb()?,
        };
        let total_cpu_percent = match self.host_total_cpu_percent {
            Some(percent) => percent,
            None => detect_total_cpu_percent(),
        };

        log::debug!(
            "Resolved runtime config: generation={:?}, memory={} MB, cpu={}%",
            generation,
            total_memory_mb,
            total_cpu_percent
        );

        Ok(ResolvedConfig {
            capacity: HostCapacity {
                total_memory_mb,
                total_cpu_percent,
            },
            generation,
            raw: self,
        })
    }
}

/// Configuration with every detected value filled in.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub raw: RuntimeConfig,
    pub generation: ControllerGeneration,
    pub capacity: HostCapacity,
}

impl ResolvedConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.raw.settle_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.raw.kill_grace_ms)
    }

    pub fn post_kill_wait(&self) -> Duration {
        Duration::from_millis(self.raw.post_kill_wait_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.raw.exec_timeout_secs)
    }

    pub fn detach_timeout(&self) -> Duration {
        Duration::from_secs(self.raw.detach_timeout_secs)
    }

    pub fn hostname_for(&self, name: &str) -> String {
        format!("{}{}", self.raw.hostname_prefix, name)
    }
}

fn is_device_id(value: &str) -> bool {
    match value.split_once(':') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn detect_total_memory_mb() -> Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")
        .map_err(|e| EnvError::Config(format!("Failed to read /proc/meminfo: {}", e)))?;
    parse_mem_total_mb(&meminfo)
        .ok_or_else(|| EnvError::Config("MemTotal missing from /proc/meminfo".to_string()))
}

fn parse_mem_total_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

fn detect_total_cpu_percent() -> u32 {
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let cores = if online > 0 { online as u32 } else { 1 };
    cores * 100
}
