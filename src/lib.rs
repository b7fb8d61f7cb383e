//! cloudenv: isolated, resource-bounded execution environments on one Linux host
//!
//! Each environment is a long-lived supervisor process running under fresh
//! PID, mount, UTS, IPC and network namespaces, confined by a cgroup that
//! carries its CPU, memory and I/O limits.
//!
//! # Architecture
//!
//! ## Host Primitives ([`kernel`])
//! - [`kernel::runner`]: Privileged command execution with permissive output decoding
//! - [`kernel::process`]: Liveness probes and namespace init discovery via `/proc`
//! - [`kernel::namespace`]: Init script rendering and namespace launch
//! - [`kernel::cgroup`]: Resource governance (v1/v2 backends)
//!
//! ## Lifecycle Core ([`core`])
//! - [`core::limits`]: Resource intent to controller values
//! - [`core::supervisor`]: Isolation checks and TERM/KILL escalation
//! - [`core::executor`]: Synchronous and detached command execution
//! - [`core::reconcile`]: Failure inference from the environment log
//! - [`core::manager`]: The orchestrator (`create`, `status`, `exec`, `halt`, `resume`, `destroy`)
//!
//! ## Safety & Persistence ([`safety`])
//! - [`safety::layout`]: Environment paths and name validation
//! - [`safety::writer`]: Atomic installs and locked log appends
//! - [`safety::lock`]: Advisory file locks
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: JSON lifecycle events on the `cloudenv::audit` target
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: Runtime configuration and host detection
//! - [`config::types`]: Shared types and the error enum
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::SimulatedHost`]: Unprivileged stand-in for namespace and cgroup tooling

// Host Primitives
pub mod kernel;

// Lifecycle Core
pub mod core;

// Safety & Persistence
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the cloudenv binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::settings::{ResolvedConfig, RuntimeConfig};
pub use config::types::*;
pub use crate::core::manager::EnvironmentManager;
pub use crate::core::types::{ExecOutcome, ExecRequest};
