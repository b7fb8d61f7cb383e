/// Namespace launch and entry
/// Builds the init script of an environment and starts it under a fresh set
/// of PID, mount, UTS, IPC and network namespaces.
use crate::config::types::{EnvError, Result};
use crate::kernel::process::ProcessTable;
use crate::kernel::runner::{shell_quote, CommandRunner, Invocation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Namespaces created for every environment, as `unshare` flags.
pub const UNSHARE_FLAGS: [&str; 6] = ["--fork", "--pid", "--mount", "--uts", "--ipc", "--net"];

/// Argument prefix that runs a command inside the namespaces of `host_pid`.
pub fn enter_prefix(host_pid: u32) -> Vec<String> {
    ["nsenter", "-t", &host_pid.to_string(), "-m", "-u", "-i", "-n", "-p"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Render the supervisor script run as PID 1 of the namespace.
///
/// The script logs its progress to `log_path`, mounts a private `/proc`,
/// sets the hostname and then idles until it receives TERM or INT.
pub fn render_init_script(name: &str, log_path: &Path, hostname: &str) -> String {
    let log = shell_quote(&log_path.to_string_lossy());
    let hostname = shell_quote(hostname);
    format!(
        r#"#!/bin/bash
LOG={log}
log() {{
    printf '[%s] %s\n' "$(date '+%Y-%m-%d %H:%M:%S')" "$*" >> "$LOG" 2>/dev/null
}}

log "=== ENVIRONMENT {name} STARTING (pid $$) ==="
if ! mount -t proc proc /proc 2>/dev/null; then
    log "WARNING: private /proc mount failed, process list may show host processes"
fi

export PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin
export HOME=/root

hostname {hostname} 2>/dev/null || log "WARNING: could not set hostname"
log "Hostname: $(hostname)"
log "Visible processes:"
ps -e -o pid,comm >> "$LOG" 2>&1
log "Proc mounts:"
grep ' /proc ' /proc/mounts >> "$LOG" 2>&1
log "=== ENVIRONMENT {name} READY ==="

trap 'log "Supervisor received termination signal"; exit 0' TERM INT
while :; do
    sleep 3600 &
    wait $!
done
"#,
        log = log,
        name = name,
        hostname = hostname,
    )
}

/// Everything needed to start one namespace.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub name: String,
    pub init_script: PathBuf,
    pub workdir: PathBuf,
    /// Wrapper placing the launch into a cgroup (legacy hierarchies)
    pub launch_prefix: Vec<String>,
    pub settle_delay: Duration,
}

impl LaunchSpec {
    /// Full host command line, without the privilege wrapper.
    pub fn invocation(&self) -> Invocation {
        let mut argv = self.launch_prefix.clone();
        argv.push("unshare".to_string());
        argv.extend(UNSHARE_FLAGS.iter().map(|s| s.to_string()));
        argv.extend([
            "bash".to_string(),
            "-c".to_string(),
            r#"cd "$1" && exec bash "$2""#.to_string(),
            "bash".to_string(),
            self.workdir.to_string_lossy().into_owned(),
            self.init_script.to_string_lossy().into_owned(),
        ]);
        Invocation::Argv(argv)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchHandle {
    /// PID returned by the spawn (wrapper, `unshare` or the init itself)
    pub spawned_pid: u32,
    /// Host-visible PID of the namespace init
    pub host_pid: u32,
}

pub struct NamespaceLauncher<'a> {
    runner: &'a dyn CommandRunner,
    processes: &'a dyn ProcessTable,
}

impl<'a> NamespaceLauncher<'a> {
    pub fn new(runner: &'a dyn CommandRunner, processes: &'a dyn ProcessTable) -> Self {
        Self { runner, processes }
    }

    /// Start the namespace detached and resolve the init's host PID once
    /// the settle delay has passed.
    pub fn launch(&self, spec: &LaunchSpec) -> Result<LaunchHandle> {
        let invocation = spec.invocation();
        log::info!("Launching namespace for '{}': {}", spec.name, invocation.describe());

        let spawned_pid = self
            .runner
            .spawn_detached(&invocation)
            .map_err(|e| EnvError::LaunchFailure(format!("spawn failed: {}", e)))?;

        std::thread::sleep(spec.settle_delay);

        let host_pid = match self.processes.namespace_init(spawned_pid) {
            Some(pid) => pid,
            None => {
                log::debug!(
                    "No namespace init found under pid {}, using spawned pid",
                    spawned_pid
                );
                spawned_pid
            }
        };

        log::info!(
            "Namespace for '{}' spawned as pid {}, init host pid {}",
            spec.name,
            spawned_pid,
            host_pid
        );
        Ok(LaunchHandle {
            spawned_pid,
            host_pid,
        })
    }
}
