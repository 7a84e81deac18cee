//! # Storybook Common
//!
//! Shared pieces for the Storybook offline worker crates.
//!
//! ## Features
//!
//! - Worker configuration (cache version, scope, precache list, offline document)
//! - Configuration validation with typed errors
//! - Logging configuration and setup

pub mod config;
pub mod logging;

pub use config::{ConfigError, OfflineConfig, DEFAULT_CACHE_PREFIX, DEFAULT_OFFLINE_PATH};
pub use logging::{init_logging, LogConfig, LogFormat};
