//! Configuration and logging

pub mod config;
pub mod logging;

pub use config::{ConfigError, WisnConfig};
pub use logging::init_logging;
