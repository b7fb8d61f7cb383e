/// Core types and structures for the cloudenv system
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Resource intent supplied by the caller for one environment.
///
/// CPU is expressed as a percentage of a single core: `100` is one full
/// core, `150` one and a half. Host capacity uses the same unit
/// (online cores x 100).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU share in percent of one core
    pub cpu_percent: u32,
    /// Hard memory cap in MiB
    pub memory_mb: u64,
    /// Read and write throughput cap in MiB/s (`None` or `0` disables throttling)
    #[serde(default)]
    pub io_mbps: Option<u64>,
}

impl ResourceLimits {
    pub fn new(cpu_percent: u32, memory_mb: u64, io_mbps: Option<u64>) -> Self {
        Self {
            cpu_percent,
            memory_mb,
            io_mbps,
        }
    }

    /// I/O throttle in MiB/s, if one was requested.
    pub fn io_throttle(&self) -> Option<u64> {
        self.io_mbps.filter(|mbps| *mbps > 0)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_percent: 100,
            memory_mb: 1024,
            io_mbps: Some(10),
        }
    }
}

/// Lifecycle state of an environment.
///
/// `NotFound` is derived (no on-disk record) and never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Creating,
    Running,
    Stopped,
    Error,
    NotFound,
}

impl EnvStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvStatus::Creating => "creating",
            EnvStatus::Running => "running",
            EnvStatus::Stopped => "stopped",
            EnvStatus::Error => "error",
            EnvStatus::NotFound => "not_found",
        }
    }

    /// States whose claim must be checked against a liveness probe.
    pub fn claims_live_process(&self) -> bool {
        matches!(self, EnvStatus::Creating | EnvStatus::Running)
    }
}

impl std::fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk record of one environment (`<base>/<name>/env.json`).
///
/// The status field is a cache of the last known truth; `running` is
/// always re-checked against the host PID before it is reported.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub name: String,
    pub limits: ResourceLimits,
    pub status: EnvStatus,
    /// PID of the namespace init as seen from the host
    pub host_pid: Option<u32>,
    /// Cgroup node name
    pub cgroup: String,
    pub log_path: PathBuf,
    pub workspace_path: PathBuf,
    /// Most recent command submitted through exec (display only)
    #[serde(default)]
    pub last_command: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentRecord {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Detached command registered against an environment (`jobs.json`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: String,
    pub command: String,
    /// Host path of the wrapper script (removed once launched)
    pub script: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Exit code parsed from the completion marker, once it appears in the log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl BackgroundJob {
    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Custom error types for cloudenv
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("Invalid environment name '{0}'")]
    InvalidName(String),

    #[error("Environment '{0}' already exists")]
    AlreadyExists(String),

    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("Environment '{name}' is not running (status: {status})")]
    EnvironmentNotRunning { name: String, status: EnvStatus },

    #[error("Launch failure: {0}")]
    LaunchFailure(String),

    #[error("Command timed out after {:?}", timeout)]
    CommandTimeout { timeout: Duration },

    #[error("Privileged operation failed ({command}): {stderr}")]
    PrivilegedOperationFailure {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EnvError {
    pub fn privileged(command: impl Into<String>, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        EnvError::PrivilegedOperationFailure {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Stable exit code for the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            EnvError::ResourceLimitExceeded(_) => 3,
            EnvError::InvalidLimits(_) | EnvError::InvalidName(_) => 2,
            EnvError::AlreadyExists(_) => 4,
            EnvError::EnvironmentNotFound(_) => 5,
            EnvError::EnvironmentNotRunning { .. } => 6,
            EnvError::LaunchFailure(_) => 7,
            EnvError::CommandTimeout { .. } => 124,
            EnvError::PrivilegedOperationFailure { .. } => 77,
            EnvError::Config(_) => 78,
            EnvError::Io(_) => 74,
            EnvError::Serialization(_) => 65,
        }
    }
}

/// Result type alias for cloudenv operations
pub type Result<T> = std::result::Result<T, EnvError>;

/// `(exit_code, stdout, stderr)` rendering of an operation for the request
/// layer and the command-line front end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl OperationReport {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(err: &EnvError) -> Self {
        Self {
            exit_code: err.exit_code(),
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }
}
