//! tl-core: Configuration and shared errors for termlink
//!
//! This crate provides the configuration structures used by the bridge
//! library and its command-line front end.

pub mod config;
pub mod error;

pub use config::BridgeConfig;
pub use error::ConfigError;
