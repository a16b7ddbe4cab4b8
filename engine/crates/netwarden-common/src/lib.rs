//! NetWarden Common - Shared utilities: logging and configuration
//!
//! This crate provides common functionality used across all NetWarden crates.

pub mod config;
pub mod logging;

pub use config::{Config, ConfigBuilder};
pub use logging::init_logging_with_config;
