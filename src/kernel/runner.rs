//! Privileged command execution.
//!
//! Every host side effect that needs elevated rights goes through a
//! [`CommandRunner`]. User-supplied text only ever travels as a positional
//! argument; the shell text of an [`Invocation::Script`] is generated by this
//! crate.

use crate::config::types::{EnvError, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

/// A command to run on the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invocation {
    /// Program followed by its arguments
    Argv(Vec<String>),
    /// `bash -c <text> bash <args...>`
    Script { text: String, args: Vec<String> },
}

impl Invocation {
    pub fn argv<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::Argv(parts.into_iter().map(Into::into).collect())
    }

    pub fn script<I, S>(text: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::Script {
            text: text.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Full argument vector, without any privilege wrapper.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Invocation::Argv(parts) => parts.clone(),
            Invocation::Script { text, args } => {
                let mut argv = vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    text.clone(),
                    "bash".to_string(),
                ];
                argv.extend(args.iter().cloned());
                argv
            }
        }
    }

    /// Short human-readable form for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Invocation::Argv(parts) => parts.join(" "),
            Invocation::Script { args, .. } => format!("bash -c <script> {}", args.join(" ")),
        }
    }
}

/// Captured result of one invocation. A non-zero exit is data, not an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`EnvError::PrivilegedOperationFailure`].
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(EnvError::privileged(
                what,
                Some(self.exit_code),
                self.stderr.trim().to_string(),
            ))
        }
    }
}

/// Decode process output, falling back to Latin-1 so no byte is ever lost.
pub fn decode_output(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Exit code of a finished process; signal deaths map to `128 + signo`.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signo)) => 128 + signo,
        (None, None) => -1,
    }
}

/// Single-quote `text` for embedding in generated shell scripts.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run with an upper bound on wall time.
    fn run_with_timeout(&self, invocation: &Invocation, timeout: Duration)
        -> Result<CommandOutput>;

    /// Start in a new session with null stdio and return the child PID.
    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32>;

    fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let what = invocation.describe();
        self.run(invocation)?.check(&what)
    }

    fn mkdir_p(&self, path: &Path) -> Result<()> {
        self.run_checked(&Invocation::argv(["mkdir", "-p", "--", &path_arg(path)]))
            .map(|_| ())
    }

    /// Overwrite `path` with `content` (used for cgroupfs controller files).
    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        self.run_checked(&Invocation::script(
            r#"printf '%s' "$1" > "$2""#,
            [content.to_string(), path_arg(path)],
        ))
        .map(|_| ())
    }

    /// Append the bytes of `source` to `target` (O_APPEND).
    fn append_file(&self, source: &Path, target: &Path) -> Result<()> {
        self.run_checked(&Invocation::script(
            r#"cat -- "$1" >> "$2""#,
            [path_arg(source), path_arg(target)],
        ))
        .map(|_| ())
    }

    fn copy_file(&self, source: &Path, target: &Path) -> Result<()> {
        self.run_checked(&Invocation::argv([
            "cp",
            "--",
            &path_arg(source),
            &path_arg(target),
        ]))
        .map(|_| ())
    }

    fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        self.run_checked(&Invocation::argv([
            "mv",
            "-f",
            "--",
            &path_arg(source),
            &path_arg(target),
        ]))
        .map(|_| ())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.run_checked(&Invocation::argv(["rm", "-f", "--", &path_arg(path)]))
            .map(|_| ())
    }

    /// Remove an empty directory (cgroup nodes are removed this way).
    fn remove_dir(&self, path: &Path) -> Result<()> {
        self.run_checked(&Invocation::argv(["rmdir", "--", &path_arg(path)]))
            .map(|_| ())
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        self.run_checked(&Invocation::argv(["rm", "-rf", "--", &path_arg(path)]))
            .map(|_| ())
    }

    fn chown(&self, owner: &str, path: &Path, recursive: bool) -> Result<()> {
        let target = path_arg(path);
        let mut argv = vec!["chown"];
        if recursive {
            argv.push("-R");
        }
        argv.extend([owner, "--", target.as_str()]);
        self.run_checked(&Invocation::argv(argv)).map(|_| ())
    }

    fn chmod(&self, mode: u32, path: &Path) -> Result<()> {
        let mode = format!("{:o}", mode);
        self.run_checked(&Invocation::argv(["chmod", &mode, "--", &path_arg(path)]))
            .map(|_| ())
    }

    fn read_file(&self, path: &Path) -> Result<String> {
        self.run_checked(&Invocation::argv(["cat", "--", &path_arg(path)]))
            .map(|output| output.stdout)
    }

    /// Deliver `signal` (e.g. `TERM`, `KILL`) to `pid`. Returns whether it was delivered.
    fn signal(&self, pid: u32, signal: &str) -> Result<bool> {
        let output = self.run(&Invocation::argv([
            "kill".to_string(),
            "-s".to_string(),
            signal.to_string(),
            pid.to_string(),
        ]))?;
        Ok(output.success())
    }
}

/// Runs invocations on the host, behind the configured privilege wrapper.
#[derive(Clone, Debug, Default)]
pub struct HostRunner {
    wrapper: Vec<String>,
}

impl HostRunner {
    pub fn new(wrapper: Vec<String>) -> Self {
        Self { wrapper }
    }

    fn command(&self, invocation: &Invocation) -> Result<Command> {
        let mut argv = self.wrapper.clone();
        argv.extend(invocation.to_argv());
        let (program, args) = argv.split_first().ok_or_else(|| {
            EnvError::privileged(invocation.describe(), None, "empty command line")
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl CommandRunner for HostRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        log::debug!("run: {}", invocation.describe());
        let output = self
            .command(invocation)?
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EnvError::privileged(invocation.describe(), None, e.to_string()))?;

        Ok(CommandOutput {
            exit_code: exit_code_of(&output.status),
            stdout: decode_output(&output.stdout),
            stderr: decode_output(&output.stderr),
        })
    }

    fn run_with_timeout(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        log::debug!("run ({:?} limit): {}", timeout, invocation.describe());
        let child = self
            .command(invocation)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EnvError::privileged(invocation.describe(), None, e.to_string()))?;
        let pid = child.id();

        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name("cloudenv-wait".to_string())
            .spawn(move || {
                let _ = tx.send(child.wait_with_output());
            })?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: exit_code_of(&output.status),
                stdout: decode_output(&output.stdout),
                stderr: decode_output(&output.stderr),
            }),
            Ok(Err(e)) => Err(EnvError::privileged(
                invocation.describe(),
                None,
                e.to_string(),
            )),
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    log::warn!("Failed to kill timed out command (pid {}): {}", pid, e);
                }
                Err(EnvError::CommandTimeout { timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(EnvError::privileged(
                invocation.describe(),
                None,
                "wait thread exited without a result",
            )),
        }
    }

    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32> {
        log::debug!("spawn detached: {}", invocation.describe());
        let mut cmd = self.command(invocation)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| EnvError::privileged(invocation.describe(), None, e.to_string()))?;
        let pid = child.id();

        std::thread::Builder::new()
            .name("cloudenv-reaper".to_string())
            .spawn(move || {
                let _ = child.wait();
            })?;

        Ok(pid)
    }
}
