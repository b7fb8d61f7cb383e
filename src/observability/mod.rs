//! Observability
//!
//! Structured lifecycle audit events.

pub mod audit;
