//! Cgroup backend abstraction for v1/v2 dual support.

use crate::config::types::Result;
use crate::kernel::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Controller values derived from one set of resource limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerParams {
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    /// Relative weight for v1 `cpu.shares`
    pub cpu_shares: u64,
    pub memory_max_bytes: u64,
    pub memory_high_bytes: u64,
    pub io: Option<IoThrottle>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoThrottle {
    /// `major:minor`
    pub device: String,
    pub bytes_per_sec: u64,
}

impl ControllerParams {
    /// v2 `cpu.max` value
    pub fn cpu_max(&self) -> String {
        format!("{} {}", self.cpu_quota_us, self.cpu_period_us)
    }

    /// v2 `io.max` line
    pub fn io_max(&self) -> Option<String> {
        self.io.as_ref().map(|io| {
            format!("{} rbps={} wbps={}", io.device, io.bytes_per_sec, io.bytes_per_sec)
        })
    }

    /// v1 `blkio.throttle.{read,write}_bps_device` line
    pub fn blkio_throttle(&self) -> Option<String> {
        self.io
            .as_ref()
            .map(|io| format!("{} {}", io.device, io.bytes_per_sec))
    }
}

/// Outcome of a best-effort provision; individual writes never abort it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub node: String,
    /// `file=value` pairs that were written
    pub applied: Vec<String>,
    pub failed: Vec<String>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    pub node: String,
    /// Resident PIDs that were sent SIGKILL
    pub killed: Vec<u32>,
    /// Node is gone (removed now or already absent)
    pub removed: bool,
    pub errors: Vec<String>,
}

pub trait CgroupBackend: Send + Sync {
    /// Create `node` and write every controller value.
    fn provision(&self, node: &str, params: &ControllerParams) -> ProvisionReport;

    /// Whether the init must be attached after launch (no launch wrapper).
    fn requires_post_launch_attach(&self) -> bool;

    fn attach(&self, node: &str, pid: u32) -> Result<()> {
        for procs in self.procs_files(node) {
            self.runner().write_file(&procs, &format!("{}\n", pid))?;
        }
        log::debug!("Attached pid {} to {}", pid, node);
        Ok(())
    }

    /// Every `cgroup.procs` file a process must be written to to join `node`.
    fn procs_files(&self, node: &str) -> Vec<PathBuf>;

    fn runner(&self) -> &dyn CommandRunner;

    /// PIDs currently resident in `node`.
    fn members(&self, node: &str) -> Vec<u32>;

    fn contains(&self, node: &str, pid: u32) -> bool {
        self.members(node).contains(&pid)
    }

    /// Command prefix that starts a process inside `node`.
    fn launch_prefix(&self, node: &str) -> Vec<String>;

    /// Kill resident processes and remove `node`. Absent node is success.
    fn teardown(&self, node: &str) -> TeardownReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerGeneration {
    /// cgroup v1, one hierarchy per controller
    Legacy,
    /// cgroup v2
    Unified,
}

/// Detect the hierarchy mounted at `root`: v2 preferred, v1 fallback.
pub fn detect_generation(root: &Path) -> Option<ControllerGeneration> {
    if root.join("cgroup.controllers").exists() {
        return Some(ControllerGeneration::Unified);
    }
    if root.join("memory").exists() && root.join("cpu").exists() {
        return Some(ControllerGeneration::Legacy);
    }
    None
}

/// Build the backend for `generation`.
pub fn create_cgroup_backend(
    generation: ControllerGeneration,
    runner: Arc<dyn CommandRunner>,
    root: &Path,
    kill_wait: Duration,
) -> Box<dyn CgroupBackend> {
    log::debug!("Cgroup backend selection: {:?} at {}", generation, root.display());
    match generation {
        ControllerGeneration::Unified => Box::new(crate::kernel::cgroup::v2::CgroupV2::new(
            runner,
            root.to_path_buf(),
            kill_wait,
        )),
        ControllerGeneration::Legacy => Box::new(crate::kernel::cgroup::v1::CgroupV1::new(
            runner,
            root.to_path_buf(),
            kill_wait,
        )),
    }
}

/// Write one controller file, recording the outcome in `report`.
pub(crate) fn write_control(
    runner: &dyn CommandRunner,
    report: &mut ProvisionReport,
    path: &Path,
    value: &str,
) {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    match runner.write_file(path, value) {
        Ok(()) => report.applied.push(format!("{}={}", file, value)),
        Err(e) => {
            log::warn!("Failed to set {} on {}: {}", file, report.node, e);
            report.failed.push(format!("{}: {}", file, e));
        }
    }
}

/// PIDs listed in a `cgroup.procs` file; missing or unreadable is empty.
pub(crate) fn read_procs(runner: &dyn CommandRunner, procs: &Path) -> Vec<u32> {
    if !procs.exists() {
        return Vec::new();
    }
    let content = match std::fs::read_to_string(procs) {
        Ok(content) => content,
        Err(_) => runner.read_file(procs).unwrap_or_default(),
    };
    content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// SIGKILL every PID and record which ones were delivered.
pub(crate) fn kill_members(runner: &dyn CommandRunner, report: &mut TeardownReport, pids: &[u32]) {
    for &pid in pids {
        match runner.signal(pid, "KILL") {
            Ok(true) => report.killed.push(pid),
            Ok(false) => log::debug!("pid {} in {} already gone", pid, report.node),
            Err(e) => report.errors.push(format!("kill {}: {}", pid, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(io: Option<IoThrottle>) -> ControllerParams {
        ControllerParams {
            cpu_quota_us: 50000,
            cpu_period_us: 100000,
            cpu_shares: 512,
            memory_max_bytes: 268435456,
            memory_high_bytes: 241591910,
            io,
        }
    }

    #[test]
    fn test_controller_lines() {
        let p = params(Some(IoThrottle {
            device: "8:0".to_string(),
            bytes_per_sec: 5242880,
        }));
        assert_eq!(p.cpu_max(), "50000 100000");
        assert_eq!(p.io_max().as_deref(), Some("8:0 rbps=5242880 wbps=5242880"));
        assert_eq!(p.blkio_throttle().as_deref(), Some("8:0 5242880"));
        assert_eq!(params(None).io_max(), None);
    }

    #[test]
    fn test_detect_generation() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_generation(dir.path()), None);

        std::fs::create_dir(dir.path().join("memory")).unwrap();
        std::fs::create_dir(dir.path().join("cpu")).unwrap();
        assert_eq!(detect_generation(dir.path()), Some(ControllerGeneration::Legacy));

        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory io\n").unwrap();
        assert_eq!(detect_generation(dir.path()), Some(ControllerGeneration::Unified));
    }
}
