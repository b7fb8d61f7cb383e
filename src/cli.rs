use crate::config::settings::RuntimeConfig;
use crate::config::types::{OperationReport, ResourceLimits};
use crate::core::manager::EnvironmentManager;
use crate::core::types::{render, ExecRequest};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON runtime configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start a new environment
    Create {
        name: String,
        /// CPU share in percent of one core
        #[arg(long, default_value_t = 100)]
        cpu: u32,
        /// Memory limit in MB
        #[arg(long, default_value_t = 1024)]
        mem: u64,
        /// Disk throughput limit in MB/s (0 disables throttling)
        #[arg(long)]
        io: Option<u64>,
    },
    /// Show the reconciled status of an environment
    Status { name: String },
    /// Run a command inside a running environment
    Exec {
        name: String,
        /// Run detached and return immediately
        #[arg(long)]
        background: bool,
        /// Timeout in seconds for foreground commands
        #[arg(long)]
        timeout: Option<u64>,
        /// Command line, passed to bash
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Stop the environment's supervisor process
    Halt { name: String },
    /// Restart a stopped environment with its stored limits
    Resume { name: String },
    /// Remove an environment, its cgroup and its files
    Destroy { name: String },
    /// List all environments
    List,
    /// List background jobs of an environment
    Jobs { name: String },
    /// Show resources held by running environments
    Usage,
    /// Print the environment log
    Logs { name: String },
}

fn dispatch(manager: &EnvironmentManager, command: Commands) -> OperationReport {
    match command {
        Commands::Create { name, cpu, mem, io } => {
            render(&manager.create(&name, ResourceLimits::new(cpu, mem, io)))
        }
        Commands::Status { name } => render(
            &manager
                .status(&name)
                .map(|status| json!({ "name": name, "status": status })),
        ),
        Commands::Exec {
            name,
            background,
            timeout,
            command,
        } => {
            let line = command.join(" ");
            let mut request = if background {
                ExecRequest::background(line)
            } else {
                ExecRequest::foreground(line)
            };
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            match manager.exec(&name, request) {
                Ok(outcome) => outcome.to_report(),
                Err(e) => OperationReport::failure(&e),
            }
        }
        Commands::Halt { name } => render(&manager.halt(&name)),
        Commands::Resume { name } => render(&manager.resume(&name)),
        Commands::Destroy { name } => render(&manager.destroy(&name)),
        Commands::List => render(&manager.list()),
        Commands::Jobs { name } => render(&manager.jobs(&name)),
        Commands::Usage => render(&manager.allocation()),
        Commands::Logs { name } => render(
            &manager
                .read_log(&name)
                .map(|log| json!({ "name": name, "log": log })),
        ),
    }
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let manager = EnvironmentManager::new(config.resolve()?);

    let report = dispatch(&manager, cli.command);
    if !report.stdout.is_empty() {
        println!("{}", report.stdout);
    }
    if !report.stderr.is_empty() {
        eprintln!("{}", report.stderr);
    }
    if report.exit_code != 0 {
        std::process::exit(report.exit_code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_defaults() {
        let cli = Cli::try_parse_from(["cloudenv", "create", "alpha"]).unwrap();
        match cli.command {
            Commands::Create { name, cpu, mem, io } => {
                assert_eq!(name, "alpha");
                assert_eq!(cpu, 100);
                assert_eq!(mem, 1024);
                assert_eq!(io, None);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_exec_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "cloudenv", "--config", "/etc/cloudenv.json", "exec", "alpha", "--background", "ls",
            "-la", "/tmp",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/cloudenv.json")));
        match cli.command {
            Commands::Exec {
                name,
                background,
                command,
                ..
            } => {
                assert_eq!(name, "alpha");
                assert!(background);
                assert_eq!(command.join(" "), "ls -la /tmp");
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_exec_requires_command() {
        assert!(Cli::try_parse_from(["cloudenv", "exec", "alpha"]).is_err());
    }
}
