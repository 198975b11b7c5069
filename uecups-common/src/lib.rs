//! Common types and utilities for uecupsd
//!
//! This crate provides the configuration structures and logging
//! helpers used across the uecups crates.

pub mod config;
pub mod logging;

pub use config::DaemonConfig;
pub use logging::{init_logging, init_logging_with_filter, Direction, HexDump, LogLevel};
