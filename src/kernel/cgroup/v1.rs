//! Cgroup v1 resource governance.
//!
//! Every controller has its own hierarchy, so one environment owns a node
//! under each of `cpu`, `memory` and `blkio`. Processes enter the nodes at
//! launch through `cgexec`.

use crate::kernel::cgroup::backend::{
    kill_members, read_procs, write_control, CgroupBackend, ControllerParams, ProvisionReport,
    TeardownReport,
};
use crate::kernel::runner::CommandRunner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CONTROLLERS: [&str; 3] = ["cpu", "memory", "blkio"];

pub struct CgroupV1 {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    kill_wait: Duration,
}

impl CgroupV1 {
    pub fn new(runner: Arc<dyn CommandRunner>, root: PathBuf, kill_wait: Duration) -> Self {
        Self {
            runner,
            root,
            kill_wait,
        }
    }

    fn controller_path(&self, controller: &str, node: &str) -> PathBuf {
        self.root.join(controller).join(node)
    }
}

impl CgroupBackend for CgroupV1 {
    fn provision(&self, node: &str, params: &ControllerParams) -> ProvisionReport {
        let mut report = ProvisionReport {
            node: node.to_string(),
            ..ProvisionReport::default()
        };
        let runner = self.runner.as_ref();

        for controller in CONTROLLERS {
            let path = self.controller_path(controller, node);
            if let Err(e) = runner.mkdir_p(&path) {
                log::warn!("Failed to create {} cgroup {}: {}", controller, path.display(), e);
                report.failed.push(format!("mkdir {}: {}", path.display(), e));
                continue;
            }

            match controller {
                "cpu" => {
                    write_control(
                        runner,
                        &mut report,
                        &path.join("cpu.shares"),
                        &params.cpu_shares.to_string(),
                    );
                    write_control(
                        runner,
                        &mut report,
                        &path.join("cpu.cfs_period_us"),
                        &params.cpu_period_us.to_string(),
                    );
                    write_control(
                        runner,
                        &mut report,
                        &path.join("cpu.cfs_quota_us"),
                        &params.cpu_quota_us.to_string(),
                    );
                }
                "memory" => {
                    write_control(
                        runner,
                        &mut report,
                        &path.join("memory.limit_in_bytes"),
                        &params.memory_max_bytes.to_string(),
                    );
                    write_control(
                        runner,
                        &mut report,
                        &path.join("memory.soft_limit_in_bytes"),
                        &params.memory_high_bytes.to_string(),
                    );
                }
                _ => {
                    if let Some(line) = params.blkio_throttle() {
                        for file in ["blkio.throttle.read_bps_device", "blkio.throttle.write_bps_device"] {
                            write_control(runner, &mut report, &path.join(file), &line);
                        }
                    }
                }
            }
        }

        log::info!(
            "Provisioned cgroup v1 node {} ({} applied, {} failed)",
            node,
            report.applied.len(),
            report.failed.len()
        );
        report
    }

    fn requires_post_launch_attach(&self) -> bool {
        false
    }

    fn procs_files(&self, node: &str) -> Vec<PathBuf> {
        CONTROLLERS
            .iter()
            .map(|controller| self.controller_path(controller, node).join("cgroup.procs"))
            .collect()
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn members(&self, node: &str) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .procs_files(node)
            .iter()
            .flat_map(|procs| read_procs(self.runner.as_ref(), procs))
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    fn launch_prefix(&self, node: &str) -> Vec<String> {
        vec![
            "cgexec".to_string(),
            "-g".to_string(),
            format!("{}:{}", CONTROLLERS.join(","), node),
        ]
    }

    fn teardown(&self, node: &str) -> TeardownReport {
        let mut report = TeardownReport {
            node: node.to_string(),
            ..TeardownReport::default()
        };

        let pids = self.members(node);
        kill_members(self.runner.as_ref(), &mut report, &pids);
        if !report.killed.is_empty() {
            std::thread::sleep(self.kill_wait);
        }

        let mut all_removed = true;
        for controller in CONTROLLERS {
            let path = self.controller_path(controller, node);
            if !path.exists() {
                continue;
            }
            if let Err(e) = self.runner.remove_dir(&path) {
                log::warn!("Failed to remove cgroup {}: {}", path.display(), e);
                report.errors.push(format!("rmdir {}: {}", path.display(), e));
                all_removed = false;
            }
        }
        report.removed = all_removed;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::cgroup::backend::IoThrottle;
    use crate::kernel::runner::HostRunner;

    fn backend(root: &std::path::Path) -> CgroupV1 {
        CgroupV1::new(
            Arc::new(HostRunner::new(Vec::new())),
            root.to_path_buf(),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_provision_writes_legacy_files() {
        let dir = tempfile::tempdir().unwrap();
        let params = ControllerParams {
            cpu_quota_us: 50000,
            cpu_period_us: 100000,
            cpu_shares: 512,
            memory_max_bytes: 1073741824,
            memory_high_bytes: 966367641,
            io: Some(IoThrottle {
                device: "8:0".to_string(),
                bytes_per_sec: 5242880,
            }),
        };
        let report = backend(dir.path()).provision("cloudenv_alpha", &params);
        assert!(report.is_complete(), "{:?}", report.failed);

        let read = |c: &str, f: &str| {
            std::fs::read_to_string(dir.path().join(c).join("cloudenv_alpha").join(f)).unwrap()
        };
        assert_eq!(read("cpu", "cpu.shares"), "512");
        assert_eq!(read("cpu", "cpu.cfs_quota_us"), "50000");
        assert_eq!(read("cpu", "cpu.cfs_period_us"), "100000");
        assert_eq!(read("memory", "memory.limit_in_bytes"), "1073741824");
        assert_eq!(read("memory", "memory.soft_limit_in_bytes"), "966367641");
        assert_eq!(read("blkio", "blkio.throttle.read_bps_device"), "8:0 5242880");
        assert_eq!(read("blkio", "blkio.throttle.write_bps_device"), "8:0 5242880");
    }

    #[test]
    fn test_launch_prefix_uses_cgexec() {
        let dir = tempfile::tempdir().unwrap();
        let cg = backend(dir.path());
        assert_eq!(
            cg.launch_prefix("cloudenv_alpha"),
            vec!["cgexec", "-g", "cpu,memory,blkio:cloudenv_alpha"]
        );
        assert!(!cg.requires_post_launch_attach());
    }

    #[test]
    fn test_procs_files_cover_every_controller() {
        let dir = tempfile::tempdir().unwrap();
        let files = backend(dir.path()).procs_files("cloudenv_alpha");
        assert_eq!(
            files,
            vec![
                dir.path().join("cpu/cloudenv_alpha/cgroup.procs"),
                dir.path().join("memory/cloudenv_alpha/cgroup.procs"),
                dir.path().join("blkio/cloudenv_alpha/cgroup.procs"),
            ]
        );
    }

    #[test]
    fn test_teardown_missing_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let report = backend(dir.path()).teardown("cloudenv_gone");
        assert!(report.removed);
        assert!(report.killed.is_empty());
    }
}
