use crate::config::types::{BackgroundJob, EnvStatus, OperationReport, Result};
use crate::kernel::cgroup::{ProvisionReport, TeardownReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Result of probing the process list from inside a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationReport {
    pub visible_processes: usize,
    /// Fewer processes visible than the isolation threshold
    pub isolated: bool,
}

/// Signal escalation report for halt and destroy paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// Process was gone when the report was taken
    pub exited: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub name: String,
    pub env_path: PathBuf,
    pub host_pid: u32,
    pub cgroup: String,
    pub provision: ProvisionReport,
    pub isolation: Option<IsolationReport>,
    /// Best-effort steps that did not complete
    pub degraded: Vec<String>,
}

/// Command submitted to a running environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    pub background: bool,
    /// Overrides the configured synchronous timeout
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn foreground(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            background: false,
            timeout: None,
        }
    }

    pub fn background(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            background: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a synchronous command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutput {
    pub exit_code: i32,
    /// Labelled `STDOUT:` / `STDERR:` blocks
    pub output: String,
    pub stderr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecOutcome {
    Completed(SyncOutput),
    Detached(BackgroundJob),
}

impl ExecOutcome {
    pub fn to_report(&self) -> OperationReport {
        match self {
            ExecOutcome::Completed(out) => OperationReport {
                exit_code: out.exit_code,
                stdout: out.output.clone(),
                stderr: out.stderr.clone(),
            },
            ExecOutcome::Detached(job) => OperationReport::success(format!(
                "Background job {} started: {}",
                job.id, job.command
            )),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HaltOutcome {
    pub name: String,
    /// A live supervisor was found and signalled
    pub was_running: bool,
    pub kill: Option<KillReport>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeOutcome {
    pub name: String,
    pub host_pid: Option<u32>,
    pub status: EnvStatus,
    pub already_running: bool,
    pub degraded: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyOutcome {
    pub name: String,
    pub existed: bool,
    pub halt: Option<HaltOutcome>,
    pub teardown: Option<TeardownReport>,
    pub directory_removed: bool,
    /// Sub-steps that failed; destroy itself still succeeds
    pub errors: Vec<String>,
}

/// Render an operation result as a `(exit_code, stdout, stderr)` report,
/// with the value serialized to JSON on stdout.
pub fn render<T: Serialize>(result: &Result<T>) -> OperationReport {
    match result {
        Ok(value) => match serde_json::to_string_pretty(value) {
            Ok(json) => OperationReport::success(json),
            Err(e) => OperationReport {
                exit_code: 65,
                stdout: String::new(),
                stderr: format!("Serialization error: {}", e),
            },
        },
        Err(e) => OperationReport::failure(e),
    }
}
