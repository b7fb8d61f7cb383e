//! Integration tests for the environment lifecycle
//!
//! These tests drive the full orchestrator against `SimulatedHost`, so
//! they need no privileges: the namespace init is a plain idle process and
//! the cgroup hierarchy is a scratch directory.

use cloudenv::kernel::cgroup::ControllerGeneration;
use cloudenv::kernel::process::{HostProcessTable, ProcessTable};
use cloudenv::kernel::runner::{CommandOutput, CommandRunner, Invocation};
use cloudenv::testing::SimulatedHost;
use cloudenv::{
    EnvError, EnvStatus, EnvironmentManager, ExecOutcome, ExecRequest, ResolvedConfig,
    ResourceLimits,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn manager_with(
    config: ResolvedConfig,
    host: SimulatedHost,
) -> (EnvironmentManager, Arc<SimulatedHost>) {
    let host = Arc::new(host);
    let manager =
        EnvironmentManager::with_backends(config, host.clone(), Arc::new(HostProcessTable));
    (manager, host)
}

fn manager(root: &Path) -> (EnvironmentManager, Arc<SimulatedHost>) {
    let config = SimulatedHost::config_for(root);
    let host = SimulatedHost::new(&config.raw.cgroup_root);
    manager_with(config, host)
}

fn small() -> ResourceLimits {
    ResourceLimits::new(50, 256, Some(5))
}

fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn alive(pid: u32) -> bool {
    HostProcessTable.is_alive(pid)
}

fn kill_externally(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

/// Host whose privileged copy onto one file always fails, optionally only
/// once a namespace has been launched.
struct FailingCopy {
    host: SimulatedHost,
    target: &'static str,
    after_launch: bool,
}

impl FailingCopy {
    fn refuses(&self, invocation: &Invocation) -> bool {
        let argv = invocation.to_argv();
        argv.first().map(String::as_str) == Some("cp")
            && argv.last().map_or(false, |arg| arg.ends_with(self.target))
            && (!self.after_launch || !self.host.launches().is_empty())
    }
}

impl CommandRunner for FailingCopy {
    fn run(&self, invocation: &Invocation) -> cloudenv::Result<CommandOutput> {
        if self.refuses(invocation) {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "cp: Permission denied".to_string(),
            });
        }
        self.host.run(invocation)
    }

    fn run_with_timeout(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> cloudenv::Result<CommandOutput> {
        self.host.run_with_timeout(invocation, timeout)
    }

    fn spawn_detached(&self, invocation: &Invocation) -> cloudenv::Result<u32> {
        self.host.spawn_detached(invocation)
    }
}

fn failing_manager(
    root: &Path,
    target: &'static str,
    after_launch: bool,
) -> EnvironmentManager {
    let config = SimulatedHost::config_for(root);
    let runner = FailingCopy {
        host: SimulatedHost::new(&config.raw.cgroup_root),
        target,
        after_launch,
    };
    EnvironmentManager::with_backends(config, Arc::new(runner), Arc::new(HostProcessTable))
}

/// Poll `status` until it leaves `running` or the deadline passes.
fn wait_not_running(manager: &EnvironmentManager, name: &str) -> EnvStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = manager.status(name).unwrap();
        if status != EnvStatus::Running || Instant::now() > deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_create_provisions_cgroup_and_starts_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, host) = manager(dir.path());

    let outcome = mgr.create("alpha", small()).unwrap();
    assert!(outcome.host_pid > 0);
    assert_eq!(outcome.cgroup, "cloudenv_alpha");
    assert!(outcome.provision.is_complete());
    assert_eq!(mgr.status("alpha").unwrap(), EnvStatus::Running);

    let node = dir.path().join("cgroup/cloudenv_alpha");
    assert_eq!(read(node.join("cpu.max")), "50000 100000");
    assert_eq!(read(node.join("memory.max")), "268435456");
    assert_eq!(read(node.join("memory.high")), "241591910");
    assert_eq!(read(node.join("io.max")), "8:0 rbps=5242880 wbps=5242880");
    assert_eq!(read(node.join("cgroup.procs")).trim(), outcome.host_pid.to_string());

    let env_dir = dir.path().join("envs/alpha");
    assert_eq!(env_dir, outcome.env_path);
    assert_eq!(read(env_dir.join("env.pid")).trim(), outcome.host_pid.to_string());
    assert!(read(env_dir.join("init.sh")).contains("hostname 'env-alpha'"));
    assert!(env_dir.join("workspace").is_dir());
    let log = read(env_dir.join("logs/alpha.log"));
    assert!(log.contains("=== LAUNCH alpha"));
    assert!(log.contains("running with PID"));

    let launches = host.launches();
    assert_eq!(launches.len(), 1);
    let argv = launches[0].to_argv();
    assert_eq!(argv[0], "unshare");
    for flag in ["--fork", "--pid", "--mount", "--uts", "--ipc", "--net"] {
        assert!(argv.iter().any(|a| a == flag), "missing {}", flag);
    }

    mgr.destroy("alpha").unwrap();
}

#[test]
fn test_create_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    let first = mgr.create("dup", small()).unwrap();

    assert!(matches!(
        mgr.create("dup", small()),
        Err(EnvError::AlreadyExists(_))
    ));
    // The first environment is untouched
    assert_eq!(mgr.inspect("dup").unwrap().host_pid, Some(first.host_pid));

    mgr.destroy("dup").unwrap();
}

#[test]
fn test_oversized_request_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, host) = manager(dir.path());

    let err = mgr.create("big", ResourceLimits::new(50, 8192, None)).unwrap_err();
    assert!(matches!(err, EnvError::ResourceLimitExceeded(_)));
    let err = mgr.create("big", ResourceLimits::new(400, 256, None)).unwrap_err();
    assert!(matches!(err, EnvError::ResourceLimitExceeded(_)));

    assert!(!dir.path().join("envs/big").exists());
    assert!(!dir.path().join("cgroup/cloudenv_big").exists());
    assert!(host.launches().is_empty());
    assert_eq!(mgr.status("big").unwrap(), EnvStatus::NotFound);
}

#[test]
fn test_invalid_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    assert!(matches!(
        mgr.create("../escape", small()),
        Err(EnvError::InvalidName(_))
    ));
    assert!(matches!(mgr.destroy("a/b"), Err(EnvError::InvalidName(_))));
}

#[test]
fn test_halt_stops_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    let created = mgr.create("beta", small()).unwrap();

    let halted = mgr.halt("beta").unwrap();
    assert!(halted.was_running);
    assert!(halted.kill.as_ref().map(|k| k.exited).unwrap_or(false));
    assert_eq!(mgr.status("beta").unwrap(), EnvStatus::Stopped);
    assert!(!dir.path().join("envs/beta/env.pid").exists());
    assert!(!alive(created.host_pid));

    let again = mgr.halt("beta").unwrap();
    assert!(!again.was_running);
    assert_eq!(mgr.status("beta").unwrap(), EnvStatus::Stopped);

    let unknown = mgr.halt("never-created").unwrap();
    assert!(!unknown.was_running);

    mgr.destroy("beta").unwrap();
}

#[test]
fn test_resume_relaunches_with_new_pid() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, host) = manager(dir.path());
    let created = mgr.create("gamma", small()).unwrap();
    mgr.halt("gamma").unwrap();

    let resumed = mgr.resume("gamma").unwrap();
    assert!(!resumed.already_running);
    assert_eq!(resumed.status, EnvStatus::Running);
    let new_pid = resumed.host_pid.unwrap();
    assert_ne!(new_pid, created.host_pid);
    assert_eq!(mgr.status("gamma").unwrap(), EnvStatus::Running);
    assert_eq!(host.launches().len(), 2);

    // Stored limits are re-applied
    let node = dir.path().join("cgroup/cloudenv_gamma");
    assert_eq!(read(node.join("memory.max")), "268435456");

    let again = mgr.resume("gamma").unwrap();
    assert!(again.already_running);
    assert_eq!(again.host_pid, Some(new_pid));
    assert_eq!(host.launches().len(), 2);

    assert!(matches!(
        mgr.resume("nobody"),
        Err(EnvError::EnvironmentNotFound(_))
    ));

    mgr.destroy("gamma").unwrap();
}

#[test]
fn test_exec_requires_running_environment() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, host) = manager(dir.path());

    assert!(matches!(
        mgr.exec("ghost", ExecRequest::foreground("true")),
        Err(EnvError::EnvironmentNotFound(_))
    ));

    mgr.create("delta", small()).unwrap();
    mgr.halt("delta").unwrap();
    let entered = host.entries().len();
    match mgr.exec("delta", ExecRequest::foreground("echo hi")) {
        Err(EnvError::EnvironmentNotRunning { status, .. }) => {
            assert_eq!(status, EnvStatus::Stopped)
        }
        other => panic!("expected EnvironmentNotRunning, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(
        mgr.exec("delta", ExecRequest::background("sleep 1")),
        Err(EnvError::EnvironmentNotRunning { .. })
    ));
    assert_eq!(host.entries().len(), entered, "no namespace entry expected");

    mgr.destroy("delta").unwrap();
}

#[test]
fn test_sync_exec_captures_output_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    mgr.create("eps", small()).unwrap();

    let outcome = mgr
        .exec("eps", ExecRequest::foreground("echo hello; echo oops >&2; exit 3"))
        .unwrap();
    let out = match outcome {
        ExecOutcome::Completed(out) => out,
        ExecOutcome::Detached(_) => panic!("expected a synchronous result"),
    };
    assert_eq!(out.exit_code, 3);
    assert!(out.output.starts_with("STDOUT:\nhello\n"));
    assert!(out.output.contains("STDERR:\noops\n"));
    assert_eq!(out.stderr, "oops\n");

    let pwd = match mgr.exec("eps", ExecRequest::foreground("pwd")).unwrap() {
        ExecOutcome::Completed(out) => out.output,
        ExecOutcome::Detached(_) => panic!("expected a synchronous result"),
    };
    assert!(pwd.contains("envs/eps/workspace"));

    let log = read(dir.path().join("envs/eps/logs/eps.log"));
    assert!(log.contains("Executing foreground command: echo hello"));
    assert!(log.contains("Exit code: 3"));
    assert_eq!(
        mgr.inspect("eps").unwrap().last_command.as_deref(),
        Some("pwd")
    );

    // Each command joins the environment's cgroup next to the init
    let procs = read(dir.path().join("cgroup/cloudenv_eps/cgroup.procs"));
    assert!(procs.lines().count() >= 3, "{}", procs);

    mgr.destroy("eps").unwrap();
}

#[test]
fn test_sync_exec_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    mgr.create("zeta", small()).unwrap();

    let start = Instant::now();
    let err = mgr
        .exec(
            "zeta",
            ExecRequest::foreground("sleep 5").with_timeout(Duration::from_millis(300)),
        )
        .unwrap_err();
    assert!(matches!(err, EnvError::CommandTimeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(mgr.status("zeta").unwrap(), EnvStatus::Running);
    assert!(read(dir.path().join("envs/zeta/logs/zeta.log")).contains("timed out"));

    mgr.destroy("zeta").unwrap();
}

#[test]
fn test_background_job_completion_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    mgr.create("eta", small()).unwrap();

    let job = match mgr
        .exec("eta", ExecRequest::background("echo bg-out; exit 2"))
        .unwrap()
    {
        ExecOutcome::Detached(job) => job,
        ExecOutcome::Completed(_) => panic!("expected a detached job"),
    };
    assert!(!job.script.exists(), "wrapper script should be removed");

    let deadline = Instant::now() + Duration::from_secs(5);
    let finished = loop {
        let jobs = mgr.jobs("eta").unwrap();
        let found = jobs.into_iter().find(|j| j.id == job.id).unwrap();
        if found.is_finished() || Instant::now() > deadline {
            break found;
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(finished.exit_code, Some(2));

    let log = mgr.read_log("eta").unwrap();
    assert!(log.contains(&format!("BACKGROUND STARTED [{}]: echo bg-out; exit 2", job.id)));
    assert!(log.contains("bg-out\n"));
    assert!(log.contains(&format!("BACKGROUND FINISHED [{}]: exit code: 2", job.id)));

    // A failed job marks the environment as failed once its process is gone
    let pid = mgr.inspect("eta").unwrap().host_pid.unwrap();
    kill_externally(pid);
    assert_eq!(wait_not_running(&mgr, "eta"), EnvStatus::Error);

    mgr.destroy("eta").unwrap();
}

#[test]
fn test_background_job_outlives_exec_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SimulatedHost::config_for(dir.path());
    config.raw.exec_timeout_secs = 1;
    let host = SimulatedHost::new(&config.raw.cgroup_root);
    let (mgr, host) = manager_with(config, host);
    mgr.create("slow", small()).unwrap();

    let start = Instant::now();
    let job = match mgr
        .exec("slow", ExecRequest::background("sleep 2; echo woke"))
        .unwrap()
    {
        ExecOutcome::Detached(job) => job,
        ExecOutcome::Completed(_) => panic!("expected a detached job"),
    };
    assert!(start.elapsed() < Duration::from_secs(1));
    let entry = host.entries().last().unwrap().to_argv();
    assert!(entry.iter().any(|a| a.ends_with("cloudenv_slow/cgroup.procs")));

    let finished = format!("BACKGROUND FINISHED [{}]: exit code: 0", job.id);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !mgr.read_log("slow").unwrap().contains(&finished) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    let log = mgr.read_log("slow").unwrap();
    assert!(log.contains(&finished));
    assert!(log.contains("woke\n"));
    assert_eq!(mgr.status("slow").unwrap(), EnvStatus::Running);

    mgr.destroy("slow").unwrap();
}

#[test]
fn test_dead_supervisor_without_failures_is_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    let created = mgr.create("theta", small()).unwrap();

    kill_externally(created.host_pid);
    assert_eq!(wait_not_running(&mgr, "theta"), EnvStatus::Stopped);
    assert_eq!(mgr.inspect("theta").unwrap().host_pid, None);

    mgr.destroy("theta").unwrap();
}

#[test]
fn test_launch_failure_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let config = SimulatedHost::config_for(dir.path());
    let host = SimulatedHost::new(&config.raw.cgroup_root).with_failing_init();
    let (mgr, _) = manager_with(config, host);

    let err = mgr.create("iota", small()).unwrap_err();
    assert!(matches!(err, EnvError::LaunchFailure(_)));
    assert_eq!(mgr.status("iota").unwrap(), EnvStatus::Error);
    assert!(mgr.read_log("iota").unwrap().contains("LAUNCH FAILURE:"));
    // Partial state is kept until destroy
    assert!(dir.path().join("envs/iota").exists());

    mgr.destroy("iota").unwrap();
    assert!(!dir.path().join("envs/iota").exists());
}

#[test]
fn test_failed_init_install_ends_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = failing_manager(dir.path(), "init.sh.partial", false);

    let err = mgr.create("stuck", small()).unwrap_err();
    assert!(matches!(err, EnvError::LaunchFailure(_)), "{:?}", err);
    assert_eq!(mgr.status("stuck").unwrap(), EnvStatus::Error);
    assert_eq!(mgr.allocation().unwrap().environments, 0);
    let log = mgr.read_log("stuck").unwrap();
    assert!(log.contains("LAUNCH FAILURE: init script not installed"), "{}", log);

    mgr.destroy("stuck").unwrap();
    assert!(!dir.path().join("envs/stuck").exists());
}

#[test]
fn test_unsaved_running_record_kills_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = failing_manager(dir.path(), "env.json.partial", true);

    let err = mgr.create("lost", small()).unwrap_err();
    assert!(matches!(err, EnvError::LaunchFailure(_)), "{:?}", err);

    let pid: u32 = read(dir.path().join("envs/lost/env.pid")).trim().parse().unwrap();
    assert!(!alive(pid));
    assert_eq!(mgr.status("lost").unwrap(), EnvStatus::Error);
    assert_eq!(mgr.allocation().unwrap().environments, 0);

    mgr.destroy("lost").unwrap();
}

#[test]
fn test_destroy_removes_everything_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    let created = mgr.create("kappa", small()).unwrap();

    let outcome = mgr.destroy("kappa").unwrap();
    assert!(outcome.existed);
    assert!(outcome.directory_removed);
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert!(outcome.halt.map(|h| h.was_running).unwrap_or(false));
    assert!(!dir.path().join("envs/kappa").exists());
    assert!(!dir.path().join("cgroup/cloudenv_kappa").exists());
    assert!(!alive(created.host_pid));
    assert_eq!(mgr.status("kappa").unwrap(), EnvStatus::NotFound);

    let again = mgr.destroy("kappa").unwrap();
    assert!(!again.existed);
    assert!(again.errors.is_empty(), "{:?}", again.errors);
}

#[test]
fn test_list_and_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, _) = manager(dir.path());
    assert!(mgr.list().unwrap().is_empty());

    mgr.create("one", ResourceLimits::new(50, 512, None)).unwrap();
    mgr.create("two", ResourceLimits::new(100, 1024, None)).unwrap();

    let names: Vec<String> = mgr.list().unwrap().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["one", "two"]);

    let usage = mgr.allocation().unwrap();
    assert_eq!(usage.environments, 2);
    assert_eq!(usage.cpu_percent, 150);
    assert_eq!(usage.memory_mb, 1536);

    mgr.halt("one").unwrap();
    let usage = mgr.allocation().unwrap();
    assert_eq!(usage.environments, 1);
    assert_eq!(usage.memory_mb, 1024);

    mgr.destroy("one").unwrap();
    mgr.destroy("two").unwrap();
}

#[test]
fn test_aggregate_capacity_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SimulatedHost::config_for(dir.path());
    config.raw.enforce_aggregate_capacity = true;
    let host = SimulatedHost::new(&config.raw.cgroup_root);
    let (mgr, _) = manager_with(config, host);

    mgr.create("first", ResourceLimits::new(150, 1024, None)).unwrap();
    assert!(matches!(
        mgr.create("second", ResourceLimits::new(100, 512, None)),
        Err(EnvError::ResourceLimitExceeded(_))
    ));
    assert!(!dir.path().join("envs/second").exists());
    mgr.create("third", ResourceLimits::new(50, 512, None)).unwrap();

    mgr.destroy("first").unwrap();
    mgr.destroy("third").unwrap();
}

#[test]
fn test_legacy_hierarchy_uses_cgexec() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SimulatedHost::config_for(dir.path());
    config.generation = ControllerGeneration::Legacy;
    let host = SimulatedHost::new(&config.raw.cgroup_root);
    let (mgr, host) = manager_with(config, host);

    mgr.create("lambda", small()).unwrap();
    assert_eq!(mgr.status("lambda").unwrap(), EnvStatus::Running);

    let argv = host.launches()[0].to_argv();
    assert_eq!(&argv[..3], ["cgexec", "-g", "cpu,memory,blkio:cloudenv_lambda"]);

    let cg = dir.path().join("cgroup");
    assert_eq!(read(cg.join("cpu/cloudenv_lambda/cpu.shares")), "512");
    assert_eq!(read(cg.join("cpu/cloudenv_lambda/cpu.cfs_quota_us")), "50000");
    assert_eq!(
        read(cg.join("memory/cloudenv_lambda/memory.limit_in_bytes")),
        "268435456"
    );
    assert_eq!(
        read(cg.join("blkio/cloudenv_lambda/blkio.throttle.write_bps_device")),
        "8:0 5242880"
    );

    mgr.destroy("lambda").unwrap();
    assert!(!cg.join("cpu/cloudenv_lambda").exists());
    assert!(!cg.join("memory/cloudenv_lambda").exists());
}

#[test]
fn test_launch_invocation_is_recorded_before_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let (mgr, host) = manager(dir.path());
    mgr.create("mu", small()).unwrap();
    match &host.launches()[0] {
        Invocation::Argv(argv) => assert!(argv.iter().any(|a| a.ends_with("init.sh"))),
        other => panic!("unexpected launch {:?}", other),
    }
    mgr.destroy("mu").unwrap();
}
