//! Safety and persistence
//!
//! Environment paths, locked log appends and atomic file installs.

pub mod layout;
pub mod lock;
pub mod writer;
