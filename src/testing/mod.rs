//! Testing infrastructure
//!
//! [`SimulatedHost`] runs the whole lifecycle without root: plain file
//! operations execute for real, while namespace and cgroup tooling is
//! rewritten into unprivileged equivalents.

use crate::config::settings::{ResolvedConfig, RuntimeConfig};
use crate::config::types::Result;
use crate::kernel::cgroup::ControllerGeneration;
use crate::kernel::runner::{CommandOutput, CommandRunner, HostRunner, Invocation};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Length of the `nsenter -t <pid> -m -u -i -n -p` prefix.
const ENTER_PREFIX_LEN: usize = 8;

pub struct SimulatedHost {
    inner: HostRunner,
    cgroup_root: PathBuf,
    init_command: Vec<String>,
    launches: Mutex<Vec<Invocation>>,
    entries: Mutex<Vec<Invocation>>,
}

impl SimulatedHost {
    /// The namespace init is replaced by an idle `sleep`.
    pub fn new(cgroup_root: &Path) -> Self {
        Self {
            inner: HostRunner::new(Vec::new()),
            cgroup_root: cgroup_root.to_path_buf(),
            init_command: vec!["sleep".to_string(), "120".to_string()],
            launches: Mutex::new(Vec::new()),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Replace the namespace init with a process that exits immediately.
    pub fn with_failing_init(mut self) -> Self {
        self.init_command = vec!["true".to_string()];
        self
    }

    /// Launch command lines seen so far, before rewriting.
    pub fn launches(&self) -> Vec<Invocation> {
        self.launches
            .lock()
            .map(|launches| launches.clone())
            .unwrap_or_default()
    }

    /// `nsenter` command lines seen so far, before rewriting.
    pub fn entries(&self) -> Vec<Invocation> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Configuration laid out under `root` for use with this host.
    pub fn config_for(root: &Path) -> ResolvedConfig {
        let raw = RuntimeConfig {
            base_dir: root.join("envs"),
            cgroup_root: root.join("cgroup"),
            generation: Some(ControllerGeneration::Unified),
            host_total_memory_mb: Some(4096),
            host_total_cpu_percent: Some(200),
            privilege_wrapper: Vec::new(),
            owner: None,
            settle_delay_ms: 300,
            kill_grace_ms: 500,
            post_kill_wait_ms: 200,
            exec_timeout_secs: 30,
            detach_timeout_secs: 5,
            lock_dir: root.join("locks"),
            ..RuntimeConfig::default()
        };
        ResolvedConfig {
            generation: ControllerGeneration::Unified,
            capacity: crate::core::limits::HostCapacity {
                total_memory_mb: 4096,
                total_cpu_percent: 200,
            },
            raw,
        }
    }

    fn rewrite(&self, invocation: &Invocation) -> Invocation {
        let argv = match invocation {
            Invocation::Argv(argv) => argv,
            Invocation::Script { .. } => return invocation.clone(),
        };
        if argv.iter().any(|arg| arg == "unshare") {
            return Invocation::Argv(self.init_command.clone());
        }
        if argv.first().map(String::as_str) == Some("nsenter") && argv.len() > ENTER_PREFIX_LEN {
            if let Ok(mut entries) = self.entries.lock() {
                entries.push(invocation.clone());
            }
            return Invocation::Argv(argv[ENTER_PREFIX_LEN..].to_vec());
        }
        invocation.clone()
    }

    /// cgroupfs lets `rmdir` remove a node that still lists control files.
    fn emulate_cgroup_rmdir(&self, invocation: &Invocation) -> Option<Result<CommandOutput>> {
        let argv = match invocation {
            Invocation::Argv(argv) if argv.first().map(String::as_str) == Some("rmdir") => argv,
            _ => return None,
        };
        let target = PathBuf::from(argv.last()?);
        if !target.starts_with(&self.cgroup_root) {
            return None;
        }
        Some(match std::fs::remove_dir_all(&target) {
            Ok(()) => Ok(CommandOutput::default()),
            Err(e) => Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: e.to_string(),
            }),
        })
    }
}

impl CommandRunner for SimulatedHost {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        if let Some(result) = self.emulate_cgroup_rmdir(invocation) {
            return result;
        }
        self.inner.run(&self.rewrite(invocation))
    }

    fn run_with_timeout(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.inner.run_with_timeout(&self.rewrite(invocation), timeout)
    }

    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32> {
        if let Ok(mut launches) = self.launches.lock() {
            launches.push(invocation.clone());
        }
        self.inner.spawn_detached(&self.rewrite(invocation))
    }
}
