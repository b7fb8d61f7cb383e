//! Environment lifecycle core.
//!
//! Resource translation, process supervision, command execution and the
//! orchestrator that ties them to the on-disk record.

pub mod executor;
pub mod jobs;
pub mod limits;
pub mod manager;
pub mod reconcile;
pub mod supervisor;
pub mod types;
