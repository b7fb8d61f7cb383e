//! Liveness, isolation checks and termination of namespace inits.

use crate::config::types::Result;
use crate::core::types::{IsolationReport, KillReport};
use crate::kernel::namespace::enter_prefix;
use crate::kernel::process::ProcessTable;
use crate::kernel::runner::{CommandRunner, Invocation};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ProcessSupervisor {
    runner: Arc<dyn CommandRunner>,
    processes: Arc<dyn ProcessTable>,
    kill_grace: Duration,
    post_kill_wait: Duration,
    isolation_threshold: usize,
}

impl ProcessSupervisor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        processes: Arc<dyn ProcessTable>,
        kill_grace: Duration,
        post_kill_wait: Duration,
        isolation_threshold: usize,
    ) -> Self {
        Self {
            runner,
            processes,
            kill_grace,
            post_kill_wait,
            isolation_threshold,
        }
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.is_alive(pid)
    }

    /// Count the processes visible from inside the namespace of `host_pid`.
    pub fn verify_isolation(&self, host_pid: u32) -> Result<IsolationReport> {
        let mut argv = enter_prefix(host_pid);
        argv.extend(["ps", "-e", "-o", "pid="].iter().map(|s| s.to_string()));
        let output = self.runner.run_checked(&Invocation::Argv(argv))?;

        let visible_processes = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count();
        let isolated = visible_processes < self.isolation_threshold;
        if !isolated {
            log::warn!(
                "Namespace of pid {} sees {} processes, isolation looks incomplete",
                host_pid,
                visible_processes
            );
        }
        Ok(IsolationReport {
            visible_processes,
            isolated,
        })
    }

    /// Poll until `pid` is gone or `limit` elapses. Returns whether it exited.
    fn wait_for_exit(&self, pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(limit));
        }
    }

    /// TERM, wait the grace period, then KILL if still alive.
    pub fn kill(&self, host_pid: u32) -> KillReport {
        let mut report = KillReport::default();
        let start = Instant::now();

        if !self.is_alive(host_pid) {
            report.exited = true;
            report.notes.push(format!("pid {} was not running", host_pid));
            return report;
        }

        match self.runner.signal(host_pid, "TERM") {
            Ok(sent) => report.term_sent = sent,
            Err(e) => report.notes.push(format!("TERM failed: {}", e)),
        }

        if !self.wait_for_exit(host_pid, self.kill_grace) {
            match self.runner.signal(host_pid, "KILL") {
                Ok(sent) => report.kill_sent = sent,
                Err(e) => report.notes.push(format!("KILL failed: {}", e)),
            }
            self.wait_for_exit(host_pid, self.post_kill_wait);
        }

        report.exited = !self.is_alive(host_pid);
        if !report.exited {
            log::warn!("pid {} survived TERM and KILL", host_pid);
        }
        report.waited_ms = start.elapsed().as_millis() as u64;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::HostProcessTable;
    use crate::kernel::runner::HostRunner;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(
            Arc::new(HostRunner::new(Vec::new())),
            Arc::new(HostProcessTable),
            Duration::from_millis(500),
            Duration::from_millis(500),
            10,
        )
    }

    #[test]
    fn test_kill_terminates_detached_process() {
        let sup = supervisor();
        let pid = HostRunner::new(Vec::new())
            .spawn_detached(&Invocation::argv(["sleep", "30"]))
            .unwrap();
        assert!(sup.is_alive(pid));

        let report = sup.kill(pid);
        assert!(report.term_sent);
        assert!(report.exited);
        assert!(!sup.is_alive(pid));
    }

    #[test]
    fn test_kill_escalates_when_term_is_ignored() {
        let sup = supervisor();
        let pid = HostRunner::new(Vec::new())
            .spawn_detached(&Invocation::script(
                "trap '' TERM; while :; do sleep 0.1; done",
                Vec::<String>::new(),
            ))
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let report = sup.kill(pid);
        assert!(report.term_sent);
        assert!(report.kill_sent);
        assert!(report.exited);
    }

    #[test]
    fn test_kill_of_dead_pid_is_noop() {
        let report = supervisor().kill(u32::MAX);
        assert!(report.exited);
        assert!(!report.term_sent);
        assert!(!report.kill_sent);
    }
}
