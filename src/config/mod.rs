//! Configuration
//!
//! Runtime settings and the shared domain types.

pub mod settings;
pub mod types;
