//! Shared basics for the modbus schema tools
//!
//! - logging setup with a runtime adjustable filter
//! - layered runtime configuration

pub mod config;
pub mod error;
pub mod logging;

pub use config::{get_config_value, load_config, load_config_from_file, RuntimeConfig};
pub use error::{Error, Result};
pub use logging::{BracketedLevelFormat, LogConfig};
