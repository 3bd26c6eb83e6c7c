//! Configuration module for the OFM correction watcher
//!
//! Handles loading configuration from TOML files, environment variable overrides,
//! and parsing of human-readable duration strings.

pub mod config;
pub mod duration;

pub use config::*;
pub use duration::{format_duration, parse_duration, DurationError};
