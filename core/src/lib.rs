//! ocifold Core - Foundational Types
//!
//! Error, result, and configuration types shared by the ocifold runtime
//! and command line.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{FoldConfig, TargetPlatform};
pub use error::{FoldError, Result};

/// ocifold version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
