//! Command execution inside a running environment.
//!
//! Synchronous commands are captured and transcribed into the environment
//! log. Detached commands run from a wrapper script that writes start and
//! completion markers around the command's own output.
//!
//! `nsenter` leaves the caller's cgroup unchanged, so both wrappers first
//! write their own PID into the environment's `cgroup.procs` files. Children
//! forked afterwards inherit the membership.

use crate::config::types::{BackgroundJob, EnvError, Result};
use crate::core::reconcile::{BACKGROUND_FINISHED, BACKGROUND_STARTED};
use crate::core::types::SyncOutput;
use crate::kernel::namespace::enter_prefix;
use crate::kernel::runner::{shell_quote, CommandRunner, Invocation};
use crate::safety::layout::EnvLayout;
use crate::safety::writer::FsWriter;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// `$1` workdir, `$2` command, then the `cgroup.procs` paths to join.
pub(crate) const SYNC_WRAPPER: &str = r##"for _cg in "${@:3}"; do { echo $$ >> "$_cg"; } 2>/dev/null; done
cd "$1" && eval "$2""##;

/// `$1` script, `$2` unused, then the `cgroup.procs` paths to join. The
/// script is read before the call returns, so the host may delete it right
/// away; only the run itself is backgrounded.
pub(crate) const DETACH_WRAPPER: &str = r##"for _cg in "${@:3}"; do { echo $$ >> "$_cg"; } 2>/dev/null; done
content=$(cat "$1") || exit 1
nohup bash -c "$content" >/dev/null 2>&1 &"##;

pub struct CommandExecutor<'a> {
    runner: &'a dyn CommandRunner,
    writer: &'a FsWriter,
    cgroup_procs: Vec<PathBuf>,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        writer: &'a FsWriter,
        cgroup_procs: Vec<PathBuf>,
    ) -> Self {
        Self {
            runner,
            writer,
            cgroup_procs,
        }
    }

    fn procs_args(&self) -> impl Iterator<Item = String> + '_ {
        self.cgroup_procs
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
    }

    /// Argv entering the namespace of `host_pid` and running `wrapper`.
    pub(crate) fn enter_argv(
        &self,
        host_pid: u32,
        wrapper: &str,
        first: String,
        second: String,
    ) -> Vec<String> {
        let mut argv = enter_prefix(host_pid);
        argv.extend([
            "bash".to_string(),
            "-c".to_string(),
            wrapper.to_string(),
            "bash".to_string(),
            first,
            second,
        ]);
        argv.extend(self.procs_args());
        argv
    }

    /// Run `command` in the namespace of `host_pid` and wait for it.
    pub fn run_sync(
        &self,
        layout: &EnvLayout,
        host_pid: u32,
        command: &str,
        timeout: Duration,
    ) -> Result<SyncOutput> {
        let argv = self.enter_argv(
            host_pid,
            SYNC_WRAPPER,
            layout.workspace().to_string_lossy().into_owned(),
            command.to_string(),
        );

        let output = match self.runner.run_with_timeout(&Invocation::Argv(argv), timeout) {
            Ok(output) => output,
            Err(EnvError::CommandTimeout { timeout }) => {
                self.writer.log_line(
                    layout,
                    &format!("Command timed out after {}s, left running", timeout.as_secs()),
                );
                return Err(EnvError::CommandTimeout { timeout });
            }
            Err(e) => return Err(e),
        };

        let combined = format!("STDOUT:\n{}\nSTDERR:\n{}", output.stdout, output.stderr);
        self.writer.append_log(
            layout,
            &format!("{}\nExit code: {}\n", combined, output.exit_code),
        );

        Ok(SyncOutput {
            exit_code: output.exit_code,
            output: combined,
            stderr: output.stderr,
        })
    }

    /// Start `command` detached in the namespace of `host_pid`.
    pub fn run_detached(
        &self,
        layout: &EnvLayout,
        host_pid: u32,
        command: &str,
        launch_timeout: Duration,
    ) -> Result<BackgroundJob> {
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let script = layout.background_script(started_at.timestamp(), &id);

        let text = render_background_script(&id, command, &layout.workspace(), &layout.log_path());
        self.writer.install_text(&script, &text)?;

        let argv = self.enter_argv(
            host_pid,
            DETACH_WRAPPER,
            script.to_string_lossy().into_owned(),
            String::new(),
        );

        let launched = self
            .runner
            .run_with_timeout(&Invocation::Argv(argv), launch_timeout);

        let result = match launched {
            Ok(output) => output.check("background launch").map(|_| ()),
            Err(EnvError::CommandTimeout { .. }) => {
                log::warn!(
                    "Background launch for '{}' did not return within {:?}, assuming started",
                    layout.name(),
                    launch_timeout
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.writer.remove_file(&script) {
            log::warn!("Failed to remove {}: {}", script.display(), e);
        }
        result?;

        self.writer
            .log_line(layout, &format!("Background job {} submitted", id));
        Ok(BackgroundJob {
            id,
            command: command.to_string(),
            script,
            started_at,
            exit_code: None,
        })
    }
}

/// Wrapper script for one detached job. The command's output goes to the
/// environment log between the start and completion markers.
pub fn render_background_script(id: &str, command: &str, workdir: &Path, log_path: &Path) -> String {
    let command = shell_quote(command);
    format!(
        r#"#!/bin/bash
LOG={log}
stamp() {{ date '+%Y-%m-%d %H:%M:%S'; }}
cd {workdir} || exit 1
printf '[%s] {started}{id}]: %s\n' "$(stamp)" {command} >> "$LOG"
bash -c {command} >> "$LOG" 2>&1
rc=$?
printf '[%s] {finished}{id}]: exit code: %s\n' "$(stamp)" "$rc" >> "$LOG"
exit $rc
"#,
        log = shell_quote(&log_path.to_string_lossy()),
        workdir = shell_quote(&workdir.to_string_lossy()),
        started = BACKGROUND_STARTED,
        finished = BACKGROUND_FINISHED,
        id = id,
        command = command,
    )
}
