/// On-disk layout of one environment
/// Every path an environment owns is derived here from the base directory
/// and the environment name, so no other module builds paths by hand.
use crate::config::types::{EnvError, Result};
use std::path::{Path, PathBuf};

/// Longest accepted environment name.
pub const MAX_NAME_LEN: usize = 63;

/// Names must match `[A-Za-z0-9][A-Za-z0-9_.-]{0,62}`: they become path
/// components, cgroup node names and part of the hostname.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && name.len() <= MAX_NAME_LEN
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EnvError::InvalidName(name.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvLayout {
    name: String,
    env_dir: PathBuf,
}

impl EnvLayout {
    /// Layout for a validated name.
    pub fn new(base_dir: &Path, name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            env_dir: base_dir.join(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.env_dir.join("logs")
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir().join(format!("{}.log", self.name))
    }

    pub fn workspace(&self) -> PathBuf {
        self.env_dir.join("workspace")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.env_dir.join("env.pid")
    }

    pub fn init_script(&self) -> PathBuf {
        self.env_dir.join("init.sh")
    }

    pub fn record(&self) -> PathBuf {
        self.env_dir.join("env.json")
    }

    pub fn jobs(&self) -> PathBuf {
        self.env_dir.join("jobs.json")
    }

    /// Wrapper script for one detached job.
    pub fn background_script(&self, timestamp: i64, job_id: &str) -> PathBuf {
        let short: String = job_id.chars().take(8).collect();
        self.env_dir.join(format!("bg_{}_{}.sh", timestamp, short))
    }

    /// Lock file guarding appends to this environment's log.
    pub fn log_lock(&self, lock_dir: &Path) -> PathBuf {
        lock_dir.join(format!("{}.log.lock", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["alpha", "A1", "env-01", "my_env.v2", "0"] {
            assert!(validate_name(name).is_ok(), "{}", name);
        }
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "-lead", ".hidden", "..", "a/b", "a b", "semi;colon", "ünï"] {
            assert!(
                matches!(validate_name(name), Err(EnvError::InvalidName(_))),
                "{}",
                name
            );
        }
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_paths() {
        let layout = EnvLayout::new(Path::new("/envs"), "alpha").unwrap();
        assert_eq!(layout.env_dir(), Path::new("/envs/alpha"));
        assert_eq!(layout.log_path(), PathBuf::from("/envs/alpha/logs/alpha.log"));
        assert_eq!(layout.workspace(), PathBuf::from("/envs/alpha/workspace"));
        assert_eq!(layout.pid_file(), PathBuf::from("/envs/alpha/env.pid"));
        assert_eq!(layout.record(), PathBuf::from("/envs/alpha/env.json"));
        assert_eq!(
            layout.background_script(1700000000, "0123456789abcdef"),
            PathBuf::from("/envs/alpha/bg_1700000000_01234567.sh")
        );
        assert_eq!(
            layout.log_lock(Path::new("/tmp/locks")),
            PathBuf::from("/tmp/locks/alpha.log.lock")
        );
    }
}
