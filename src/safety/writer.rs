//! Privileged writes into environment directories.
//!
//! Environment directories belong to the service account, so every write
//! goes through the [`CommandRunner`]. Content is staged in a private
//! temporary file first; user text never reaches a shell.

use crate::config::types::{EnvError, Result};
use crate::kernel::runner::{decode_output, CommandRunner};
use crate::safety::layout::EnvLayout;
use crate::safety::lock::with_file_lock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

pub struct FsWriter {
    runner: Arc<dyn CommandRunner>,
    owner: Option<String>,
    dir_mode: u32,
    file_mode: u32,
    lock_dir: PathBuf,
}

impl FsWriter {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        owner: Option<String>,
        dir_mode: u32,
        file_mode: u32,
        lock_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            owner,
            dir_mode,
            file_mode,
            lock_dir,
        }
    }

    /// Create the environment, log and workspace directories. Idempotent.
    pub fn ensure_layout(&self, layout: &EnvLayout) -> Result<()> {
        let dirs = [layout.env_dir().to_path_buf(), layout.log_dir(), layout.workspace()];
        for dir in &dirs {
            self.runner.mkdir_p(dir)?;
        }
        if let Some(owner) = &self.owner {
            self.runner.chown(owner, layout.env_dir(), true)?;
        }
        for dir in &dirs {
            self.runner.chmod(self.dir_mode, dir)?;
        }
        Ok(())
    }

    fn stage(&self, text: &str) -> Result<NamedTempFile> {
        let mut staged = NamedTempFile::new()?;
        staged.write_all(text.as_bytes())?;
        staged.flush()?;
        Ok(staged)
    }

    fn apply_file_perms(&self, path: &Path) -> Result<()> {
        if let Some(owner) = &self.owner {
            self.runner.chown(owner, path, false)?;
        }
        self.runner.chmod(self.file_mode, path)
    }

    /// Replace `path` with `text` atomically: readers see the old or the
    /// new content, never a partial file.
    pub fn install_text(&self, path: &Path, text: &str) -> Result<()> {
        let staged = self.stage(text)?;
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        self.runner.copy_file(staged.path(), &partial)?;
        self.runner.rename(&partial, path)?;
        self.apply_file_perms(path)
    }

    pub fn install_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut text = serde_json::to_string_pretty(value)?;
        text.push('\n');
        self.install_text(path, &text)
    }

    /// Append `text` to the environment log. Failures are logged and
    /// reported as `false`; they never abort the caller.
    pub fn append_log(&self, layout: &EnvLayout, text: &str) -> bool {
        let log_path = layout.log_path();
        let lock_path = layout.log_lock(&self.lock_dir);
        let result = with_file_lock(&lock_path, || {
            let fresh = !log_path.exists();
            if fresh {
                self.runner.mkdir_p(&layout.log_dir())?;
            }
            let staged = self.stage(text)?;
            self.runner.append_file(staged.path(), &log_path)?;
            if fresh {
                self.apply_file_perms(&log_path)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to append to {}: {}", log_path.display(), e);
                false
            }
        }
    }

    /// Append one timestamped line to the environment log.
    pub fn log_line(&self, layout: &EnvLayout, message: &str) -> bool {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.append_log(layout, &format!("[{}] {}\n", stamp, message))
    }

    /// Read a file, escalating only when a direct read is denied.
    pub fn read_text(&self, path: &Path) -> Result<Option<String>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(decode_output(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                log::debug!("Direct read of {} denied, escalating", path.display());
                self.runner.read_file(path).map(Some)
            }
            Err(e) => Err(EnvError::Io(e)),
        }
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match self.read_text(path)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn remove_file(&self, path: &Path) -> Result<()> {
        self.runner.remove_file(path)
    }

    /// Remove the whole environment directory and its log lock.
    pub fn remove_environment(&self, layout: &EnvLayout) -> Result<()> {
        self.runner.remove_tree(layout.env_dir())?;
        let lock = layout.log_lock(&self.lock_dir);
        if let Err(e) = std::fs::remove_file(&lock) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::debug!("Failed to remove {}: {}", lock.display(), e);
            }
        }
        Ok(())
    }
}
