/// Cgroup v2 backend implementation
/// Single unified hierarchy: one node per environment under the cgroup root,
/// controllers enabled through the root `cgroup.subtree_control`.
use crate::kernel::cgroup::backend::{
    kill_members, read_procs, write_control, CgroupBackend, ControllerParams, ProvisionReport,
    TeardownReport,
};
use crate::kernel::runner::CommandRunner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CONTROLLERS: [&str; 3] = ["+cpu", "+memory", "+io"];

/// Cgroup v2 backend
pub struct CgroupV2 {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    kill_wait: Duration,
}

impl CgroupV2 {
    pub fn new(runner: Arc<dyn CommandRunner>, root: PathBuf, kill_wait: Duration) -> Self {
        Self {
            runner,
            root,
            kill_wait,
        }
    }

    fn node_path(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    /// Enable the controllers we need for child nodes. Each one is
    /// attempted separately since a missing `io` controller must not
    /// prevent `cpu` and `memory` from being delegated.
    fn enable_controllers(&self) {
        let control = self.root.join("cgroup.subtree_control");
        for controller in CONTROLLERS {
            if let Err(e) = self.runner.write_file(&control, controller) {
                log::debug!("Could not enable {} in {}: {}", controller, control.display(), e);
            }
        }
    }
}

impl CgroupBackend for CgroupV2 {
    fn provision(&self, node: &str, params: &ControllerParams) -> ProvisionReport {
        let mut report = ProvisionReport {
            node: node.to_string(),
            ..ProvisionReport::default()
        };
        self.enable_controllers();

        let path = self.node_path(node);
        if let Err(e) = self.runner.mkdir_p(&path) {
            log::warn!("Failed to create cgroup {}: {}", path.display(), e);
            report.failed.push(format!("mkdir {}: {}", path.display(), e));
            return report;
        }

        let runner = self.runner.as_ref();
        write_control(runner, &mut report, &path.join("cpu.max"), &params.cpu_max());
        write_control(
            runner,
            &mut report,
            &path.join("memory.max"),
            &params.memory_max_bytes.to_string(),
        );
        write_control(
            runner,
            &mut report,
            &path.join("memory.high"),
            &params.memory_high_bytes.to_string(),
        );
        if let Some(line) = params.io_max() {
            write_control(runner, &mut report, &path.join("io.max"), &line);
        }

        log::info!(
            "Provisioned cgroup v2 node {} ({} applied, {} failed)",
            node,
            report.applied.len(),
            report.failed.len()
        );
        report
    }

    fn requires_post_launch_attach(&self) -> bool {
        true
    }

    fn procs_files(&self, node: &str) -> Vec<PathBuf> {
        vec![self.node_path(node).join("cgroup.procs")]
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn members(&self, node: &str) -> Vec<u32> {
        read_procs(self.runner.as_ref(), &self.node_path(node).join("cgroup.procs"))
    }

    fn launch_prefix(&self, _node: &str) -> Vec<String> {
        Vec::new()
    }

    fn teardown(&self, node: &str) -> TeardownReport {
        let mut report = TeardownReport {
            node: node.to_string(),
            ..TeardownReport::default()
        };
        let path = self.node_path(node);
        if !path.exists() {
            report.removed = true;
            return report;
        }

        let pids = self.members(node);
        kill_members(self.runner.as_ref(), &mut report, &pids);
        if !report.killed.is_empty() {
            std::thread::sleep(self.kill_wait);
        }

        match self.runner.remove_dir(&path) {
            Ok(()) => report.removed = true,
            Err(e) => {
                log::warn!("Failed to remove cgroup {}: {}", path.display(), e);
                report.errors.push(format!("rmdir {}: {}", path.display(), e));
            }
        }
        report
    }
}
