//! Environment lifecycle orchestration.
//!
//! [`EnvironmentManager`] owns the host backends and drives every
//! environment through `creating -> running -> stopped | error`. The
//! on-disk record (`env.json`) caches the last known state; a `running`
//! claim is always checked against the process table before it is
//! reported.

use crate::config::settings::ResolvedConfig;
use crate::config::types::{
    BackgroundJob, EnvError, EnvStatus, EnvironmentRecord, ResourceLimits, Result,
};
use crate::core::executor::CommandExecutor;
use crate::core::jobs;
use crate::core::limits::{translate, Allocation};
use crate::core::reconcile::{classify, current_run, LAUNCH_FAILURE_MARKER, LAUNCH_HEADER};
use crate::core::supervisor::ProcessSupervisor;
use crate::core::types::{
    CreateOutcome, DestroyOutcome, ExecOutcome, ExecRequest, HaltOutcome, IsolationReport,
    ResumeOutcome,
};
use crate::kernel::cgroup::{
    create_cgroup_backend, CgroupBackend, ControllerParams, ProvisionReport,
};
use crate::kernel::namespace::{render_init_script, LaunchSpec, NamespaceLauncher};
use crate::kernel::process::{HostProcessTable, ProcessTable};
use crate::kernel::runner::{CommandRunner, HostRunner};
use crate::observability::audit::{record as audit, LifecycleAction, Outcome};
use crate::safety::layout::{validate_name, EnvLayout};
use crate::safety::writer::FsWriter;
use chrono::Utc;
use std::sync::Arc;

/// What a successful launch produced.
struct Launched {
    host_pid: u32,
    provision: ProvisionReport,
    isolation: Option<IsolationReport>,
    degraded: Vec<String>,
}

/// Why a launch stopped, and the supervisor PID if one was started.
struct Aborted {
    host_pid: Option<u32>,
    reason: String,
}

impl Aborted {
    fn new(host_pid: Option<u32>, reason: impl Into<String>) -> Self {
        Self {
            host_pid,
            reason: reason.into(),
        }
    }
}

pub struct EnvironmentManager {
    config: ResolvedConfig,
    runner: Arc<dyn CommandRunner>,
    processes: Arc<dyn ProcessTable>,
    cgroups: Box<dyn CgroupBackend>,
    writer: FsWriter,
    supervisor: ProcessSupervisor,
}

impl EnvironmentManager {
    /// Manager acting on the real host.
    pub fn new(config: ResolvedConfig) -> Self {
        let runner = Arc::new(HostRunner::new(config.raw.privilege_wrapper.clone()));
        Self::with_backends(config, runner, Arc::new(HostProcessTable))
    }

    pub fn with_backends(
        config: ResolvedConfig,
        runner: Arc<dyn CommandRunner>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        let cgroups = create_cgroup_backend(
            config.generation,
            Arc::clone(&runner),
            &config.raw.cgroup_root,
            config.post_kill_wait(),
        );
        let writer = FsWriter::new(
            Arc::clone(&runner),
            config.raw.owner.clone(),
            config.raw.dir_mode,
            config.raw.file_mode,
            config.raw.lock_dir.clone(),
        );
        let supervisor = ProcessSupervisor::new(
            Arc::clone(&runner),
            Arc::clone(&processes),
            config.kill_grace(),
            config.post_kill_wait(),
            config.raw.isolation_threshold,
        );
        Self {
            config,
            runner,
            processes,
            cgroups,
            writer,
            supervisor,
        }
    }

    fn layout(&self, name: &str) -> Result<EnvLayout> {
        EnvLayout::new(&self.config.raw.base_dir, name)
    }

    fn node_name(&self, name: &str) -> String {
        format!("{}{}", self.config.raw.cgroup_prefix, name)
    }

    fn load_record(&self, layout: &EnvLayout) -> Result<Option<EnvironmentRecord>> {
        self.writer.read_json(&layout.record())
    }

    fn save_record(&self, layout: &EnvLayout, record: &mut EnvironmentRecord) -> Result<()> {
        record.touch();
        self.writer.install_json(&layout.record(), record)
    }

    /// Create and launch a new environment.
    pub fn create(&self, name: &str, limits: ResourceLimits) -> Result<CreateOutcome> {
        let layout = self.layout(name)?;
        let params = translate(&limits, &self.config.capacity, &self.config.raw.io_device)?;

        if self.load_record(&layout)?.is_some() {
            return Err(EnvError::AlreadyExists(name.to_string()));
        }
        if self.config.raw.enforce_aggregate_capacity {
            self.allocation()?.admit(&limits)?;
        }

        self.writer.ensure_layout(&layout)?;
        let now = Utc::now();
        let mut record = EnvironmentRecord {
            name: name.to_string(),
            limits,
            status: EnvStatus::Creating,
            host_pid: None,
            cgroup: self.node_name(name),
            log_path: layout.log_path(),
            workspace_path: layout.workspace(),
            last_command: None,
            created_at: now,
            updated_at: now,
        };
        self.save_record(&layout, &mut record)?;

        let launched = self.launch(&layout, &mut record, &params, LifecycleAction::Create)?;
        Ok(CreateOutcome {
            name: name.to_string(),
            env_path: layout.env_dir().to_path_buf(),
            host_pid: launched.host_pid,
            cgroup: record.cgroup.clone(),
            provision: launched.provision,
            isolation: launched.isolation,
            degraded: launched.degraded,
        })
    }

    /// Provision the cgroup, start the namespace and record the outcome.
    /// Shared by create and resume. Any failure leaves the record in
    /// `error`.
    fn launch(
        &self,
        layout: &EnvLayout,
        record: &mut EnvironmentRecord,
        params: &ControllerParams,
        action: LifecycleAction,
    ) -> Result<Launched> {
        match self.start(layout, record, params) {
            Ok(launched) => {
                let outcome = if launched.degraded.is_empty() {
                    Outcome::Success
                } else {
                    Outcome::Degraded
                };
                audit(
                    action,
                    layout.name(),
                    Some(launched.host_pid),
                    outcome,
                    (!launched.degraded.is_empty()).then(|| launched.degraded.join("; ")),
                );
                Ok(launched)
            }
            Err(aborted) => Err(self.fail_launch(layout, record, action, aborted)),
        }
    }

    fn start(
        &self,
        layout: &EnvLayout,
        record: &mut EnvironmentRecord,
        params: &ControllerParams,
    ) -> std::result::Result<Launched, Aborted> {
        let name = layout.name();
        let limits = &record.limits;
        self.writer.append_log(
            layout,
            &format!(
                "{}{} {} ===\nCPU: {}%  Memory: {} MB  I/O: {}\n",
                LAUNCH_HEADER,
                name,
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                limits.cpu_percent,
                limits.memory_mb,
                limits
                    .io_throttle()
                    .map(|mbps| format!("{} MB/s", mbps))
                    .unwrap_or_else(|| "unthrottled".to_string()),
            ),
        );

        let mut degraded = Vec::new();
        let provision = self.cgroups.provision(&record.cgroup, params);
        for failure in &provision.failed {
            self.writer
                .log_line(layout, &format!("Cgroup setting not applied: {}", failure));
            degraded.push(format!("cgroup: {}", failure));
        }

        let hostname = self.config.hostname_for(name);
        let script = render_init_script(name, &layout.log_path(), &hostname);
        self.writer
            .install_text(&layout.init_script(), &script)
            .map_err(|e| Aborted::new(None, format!("init script not installed: {}", e)))?;

        let spec = LaunchSpec {
            name: name.to_string(),
            init_script: layout.init_script(),
            workdir: layout.workspace(),
            launch_prefix: self.cgroups.launch_prefix(&record.cgroup),
            settle_delay: self.config.settle_delay(),
        };
        let launcher = NamespaceLauncher::new(self.runner.as_ref(), self.processes.as_ref());
        let host_pid = launcher
            .launch(&spec)
            .map_err(|e| Aborted::new(None, e.to_string()))?
            .host_pid;

        if let Err(e) = self
            .writer
            .install_text(&layout.pid_file(), &format!("{}\n", host_pid))
        {
            log::warn!("Failed to write pid file for '{}': {}", name, e);
            degraded.push(format!("pid file: {}", e));
        }

        if !self.supervisor.is_alive(host_pid) {
            return Err(Aborted::new(
                Some(host_pid),
                format!("supervisor process {} exited during startup", host_pid),
            ));
        }

        if self.cgroups.requires_post_launch_attach() {
            if let Err(e) = self.cgroups.attach(&record.cgroup, host_pid) {
                log::warn!("Failed to attach pid {} to {}: {}", host_pid, record.cgroup, e);
                degraded.push(format!("cgroup attach: {}", e));
            }
        }
        let membership = if self.cgroups.contains(&record.cgroup, host_pid) {
            format!("Process {} is in cgroup {}", host_pid, record.cgroup)
        } else {
            format!("Process {} not listed in cgroup {}", host_pid, record.cgroup)
        };
        self.writer.log_line(layout, &membership);

        let isolation = match self.supervisor.verify_isolation(host_pid) {
            Ok(report) => {
                self.writer.log_line(
                    layout,
                    &format!(
                        "Isolation check: {} processes visible ({})",
                        report.visible_processes,
                        if report.isolated { "isolated" } else { "not isolated" }
                    ),
                );
                Some(report)
            }
            Err(e) => {
                log::warn!("Isolation check for '{}' failed: {}", name, e);
                degraded.push(format!("isolation check: {}", e));
                None
            }
        };

        record.status = EnvStatus::Running;
        record.host_pid = Some(host_pid);
        if let Err(e) = self.save_record(layout, record) {
            self.supervisor.kill(host_pid);
            return Err(Aborted::new(
                Some(host_pid),
                format!("record not saved: {}", e),
            ));
        }
        self.writer.log_line(
            layout,
            &format!("Environment {} running with PID {}", name, host_pid),
        );

        Ok(Launched {
            host_pid,
            provision,
            isolation,
            degraded,
        })
    }

    /// Record a failed launch and build the error to return. Partial state
    /// (directory, cgroup) is kept for inspection until destroy.
    fn fail_launch(
        &self,
        layout: &EnvLayout,
        record: &mut EnvironmentRecord,
        action: LifecycleAction,
        aborted: Aborted,
    ) -> EnvError {
        let Aborted { host_pid, reason } = aborted;
        self.writer
            .log_line(layout, &format!("{} {}", LAUNCH_FAILURE_MARKER, reason));
        record.status = EnvStatus::Error;
        record.host_pid = None;
        if let Err(e) = self.save_record(layout, record) {
            log::warn!("Failed to record launch failure for '{}': {}", layout.name(), e);
        }
        audit(action, layout.name(), host_pid, Outcome::Failure, Some(reason.clone()));
        EnvError::LaunchFailure(reason)
    }

    /// Load the record and correct a stale live-process claim.
    fn reconcile(&self, layout: &EnvLayout) -> Result<Option<EnvironmentRecord>> {
        let mut record = match self.load_record(layout)? {
            Some(record) => record,
            None => return Ok(None),
        };
        if !record.status.claims_live_process() {
            return Ok(Some(record));
        }

        let current_log = || -> Result<String> {
            Ok(self.writer.read_text(&layout.log_path())?.unwrap_or_default())
        };
        let pid = match record.host_pid {
            Some(pid) => pid,
            // Creation still in flight unless its launch already failed
            None if record.status == EnvStatus::Creating => {
                if !current_run(&current_log()?).contains(LAUNCH_FAILURE_MARKER) {
                    return Ok(Some(record));
                }
                0
            }
            None => 0,
        };
        if pid != 0 && self.supervisor.is_alive(pid) {
            return Ok(Some(record));
        }

        let evidence = classify(&current_log()?, &self.config.raw.failure_markers);
        record.status = match evidence {
            Some(_) => EnvStatus::Error,
            None => EnvStatus::Stopped,
        };
        record.host_pid = None;
        if let Err(e) = self.save_record(layout, &mut record) {
            log::warn!("Failed to update record of '{}': {}", layout.name(), e);
        }

        let detail = match &evidence {
            Some(evidence) => format!("process {} gone, {}", pid, evidence),
            None => format!("process {} gone", pid),
        };
        self.writer.log_line(
            layout,
            &format!("Supervisor no longer running; status now {}", record.status),
        );
        audit(
            LifecycleAction::Reconcile,
            layout.name(),
            Some(pid),
            Outcome::Success,
            Some(detail),
        );
        Ok(Some(record))
    }

    /// Current status, reconciled against the process table.
    pub fn status(&self, name: &str) -> Result<EnvStatus> {
        let layout = self.layout(name)?;
        Ok(self
            .reconcile(&layout)?
            .map(|record| record.status)
            .unwrap_or(EnvStatus::NotFound))
    }

    /// Reconciled record of one environment.
    pub fn inspect(&self, name: &str) -> Result<EnvironmentRecord> {
        let layout = self.layout(name)?;
        self.reconcile(&layout)?
            .ok_or_else(|| EnvError::EnvironmentNotFound(name.to_string()))
    }

    /// Run a command inside a running environment.
    pub fn exec(&self, name: &str, request: ExecRequest) -> Result<ExecOutcome> {
        let layout = self.layout(name)?;
        let mut record = self
            .reconcile(&layout)?
            .ok_or_else(|| EnvError::EnvironmentNotFound(name.to_string()))?;
        let host_pid = match (record.status, record.host_pid) {
            (EnvStatus::Running, Some(pid)) => pid,
            (status, _) => {
                return Err(EnvError::EnvironmentNotRunning {
                    name: name.to_string(),
                    status,
                })
            }
        };

        record.last_command = Some(request.command.clone());
        if let Err(e) = self.save_record(&layout, &mut record) {
            log::warn!("Failed to record last command for '{}': {}", name, e);
        }
        self.writer.log_line(
            &layout,
            &format!(
                "Executing {} command: {}",
                if request.background { "background" } else { "foreground" },
                request.command
            ),
        );

        let executor = CommandExecutor::new(
            self.runner.as_ref(),
            &self.writer,
            self.cgroups.procs_files(&record.cgroup),
        );
        let result = if request.background {
            executor
                .run_detached(&layout, host_pid, &request.command, self.config.detach_timeout())
                .and_then(|job| {
                    jobs::register(&self.writer, &layout, &self.config.raw.lock_dir, &job)?;
                    Ok(ExecOutcome::Detached(job))
                })
        } else {
            let timeout = request.timeout.unwrap_or_else(|| self.config.exec_timeout());
            executor
                .run_sync(&layout, host_pid, &request.command, timeout)
                .map(ExecOutcome::Completed)
        };

        let (outcome, detail) = match &result {
            Ok(ExecOutcome::Completed(out)) => {
                (Outcome::Success, format!("exit code {}", out.exit_code))
            }
            Ok(ExecOutcome::Detached(job)) => (Outcome::Success, format!("job {}", job.id)),
            Err(e) => (Outcome::Failure, e.to_string()),
        };
        audit(LifecycleAction::Exec, name, Some(host_pid), outcome, Some(detail));
        result
    }

    /// Stop the supervisor. Unknown names and stopped environments succeed.
    pub fn halt(&self, name: &str) -> Result<HaltOutcome> {
        let layout = self.layout(name)?;
        let mut outcome = HaltOutcome {
            name: name.to_string(),
            ..HaltOutcome::default()
        };
        let mut record = match self.load_record(&layout)? {
            Some(record) => record,
            None => return Ok(outcome),
        };

        let pid = match record.host_pid {
            Some(pid) => Some(pid),
            None => self.pid_from_file(&layout),
        };
        if let Some(pid) = pid {
            if self.supervisor.is_alive(pid) {
                let report = self.supervisor.kill(pid);
                outcome.was_running = true;
                outcome.kill = Some(report);
            }
        }

        if layout.pid_file().exists() {
            if let Err(e) = self.writer.remove_file(&layout.pid_file()) {
                log::warn!("Failed to remove pid file for '{}': {}", name, e);
            }
        }

        record.status = EnvStatus::Stopped;
        record.host_pid = None;
        self.save_record(&layout, &mut record)?;
        self.writer.log_line(&layout, &format!("Environment {} halted", name));
        audit(LifecycleAction::Halt, name, pid, Outcome::Success, None);
        Ok(outcome)
    }

    fn pid_from_file(&self, layout: &EnvLayout) -> Option<u32> {
        self.writer
            .read_text(&layout.pid_file())
            .ok()
            .flatten()
            .and_then(|text| text.trim().parse().ok())
    }

    /// Relaunch a stopped or failed environment with its stored limits.
    pub fn resume(&self, name: &str) -> Result<ResumeOutcome> {
        let layout = self.layout(name)?;
        let mut record = self
            .reconcile(&layout)?
            .ok_or_else(|| EnvError::EnvironmentNotFound(name.to_string()))?;

        if record.status == EnvStatus::Running {
            return Ok(ResumeOutcome {
                name: name.to_string(),
                host_pid: record.host_pid,
                status: record.status,
                already_running: true,
                degraded: Vec::new(),
            });
        }

        let params = translate(
            &record.limits,
            &self.config.capacity,
            &self.config.raw.io_device,
        )?;
        if self.config.raw.enforce_aggregate_capacity {
            self.allocation()?.admit(&record.limits)?;
        }

        self.writer.ensure_layout(&layout)?;
        record.status = EnvStatus::Creating;
        record.host_pid = None;
        self.save_record(&layout, &mut record)?;

        let launched = self.launch(&layout, &mut record, &params, LifecycleAction::Resume)?;
        Ok(ResumeOutcome {
            name: name.to_string(),
            host_pid: Some(launched.host_pid),
            status: record.status,
            already_running: false,
            degraded: launched.degraded,
        })
    }

    /// Halt, remove the cgroup and delete the directory. Always succeeds;
    /// failed sub-steps are listed in the outcome.
    pub fn destroy(&self, name: &str) -> Result<DestroyOutcome> {
        let layout = self.layout(name)?;
        let record = self.load_record(&layout).unwrap_or_else(|e| {
            log::warn!("Unreadable record for '{}': {}", name, e);
            None
        });
        let mut outcome = DestroyOutcome {
            name: name.to_string(),
            existed: record.is_some() || layout.env_dir().exists(),
            ..DestroyOutcome::default()
        };

        if record.is_some() {
            match self.halt(name) {
                Ok(halt) => outcome.halt = Some(halt),
                Err(e) => outcome.errors.push(format!("halt: {}", e)),
            }
        }

        let node = record
            .as_ref()
            .map(|r| r.cgroup.clone())
            .unwrap_or_else(|| self.node_name(name));
        let teardown = self.cgroups.teardown(&node);
        outcome
            .errors
            .extend(teardown.errors.iter().map(|e| format!("cgroup: {}", e)));
        outcome.teardown = Some(teardown);

        match self.writer.remove_environment(&layout) {
            Ok(()) => outcome.directory_removed = true,
            Err(e) => outcome.errors.push(format!("remove directory: {}", e)),
        }

        for err in &outcome.errors {
            log::warn!("Destroy of '{}': {}", name, err);
        }
        audit(
            LifecycleAction::Destroy,
            name,
            None,
            if outcome.errors.is_empty() {
                Outcome::Success
            } else {
                Outcome::Degraded
            },
            (!outcome.errors.is_empty()).then(|| outcome.errors.join("; ")),
        );
        Ok(outcome)
    }

    /// Every environment with a record, reconciled, sorted by name.
    pub fn list(&self) -> Result<Vec<EnvironmentRecord>> {
        let entries = match std::fs::read_dir(&self.config.raw.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_name(&name).is_err() || !entry.path().is_dir() {
                continue;
            }
            match self.layout(&name).and_then(|layout| self.reconcile(&layout)) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping '{}': {}", name, e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Registered background jobs with exit codes taken from the log.
    pub fn jobs(&self, name: &str) -> Result<Vec<BackgroundJob>> {
        let layout = self.layout(name)?;
        if self.load_record(&layout)?.is_none() {
            return Err(EnvError::EnvironmentNotFound(name.to_string()));
        }
        let registered = jobs::load(&self.writer, &layout)?;
        let log = self.writer.read_text(&layout.log_path())?.unwrap_or_default();
        Ok(jobs::with_completions(registered, &log))
    }

    /// Limits held by live environments against host capacity.
    pub fn allocation(&self) -> Result<Allocation> {
        let records = self.list()?;
        let live = records
            .iter()
            .filter(|record| record.status.claims_live_process())
            .map(|record| &record.limits);
        Ok(Allocation::from_limits(live, self.config.capacity))
    }

    /// Full content of the environment log.
    pub fn read_log(&self, name: &str) -> Result<String> {
        let layout = self.layout(name)?;
        if self.load_record(&layout)?.is_none() && !layout.env_dir().exists() {
            return Err(EnvError::EnvironmentNotFound(name.to_string()));
        }
        Ok(self.writer.read_text(&layout.log_path())?.unwrap_or_default())
    }
}
