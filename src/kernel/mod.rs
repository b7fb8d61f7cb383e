//! Thin wrappers around host primitives.
//!
//! Everything that touches the host goes through a [`runner::CommandRunner`]
//! or a [`process::ProcessTable`], so the layers above can run against a
//! simulated host in tests.
//! Dependency direction: runner -> process -> namespace -> cgroup

pub mod cgroup;
pub mod namespace;
pub mod process;
pub mod runner;
