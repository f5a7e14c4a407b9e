//! Runtime settings shared by the schema tools
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed with `MODSCHEMA_`
//! 2. The config file (YAML, TOML or JSON, chosen by extension)
//! 3. Default values

use crate::error::{Error, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Prefix of environment variables overriding config values
pub const ENV_PREFIX: &str = "MODSCHEMA_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum age of a cached value before it is fetched again
    pub max_age_ms: u64,
    /// Largest run of unneeded registers read to merge two requests
    pub allowed_gap: u16,
    /// Reads in flight at the same time
    pub max_concurrent_requests: usize,
    pub log_level: String,
    /// Write log files here when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 1000,
            allowed_gap: 100,
            max_concurrent_requests: 1,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

fn file_figment(path: &Path) -> Result<Figment> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "yaml" | "yml" => Ok(Figment::new().merge(Yaml::file(path))),
        "json" => Ok(Figment::new().merge(Json::file(path))),
        _ => Err(Error::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

/// Load the runtime settings: defaults, then `path` if given, then the environment
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let mut figment = Figment::from(Serialized::defaults(RuntimeConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(file_figment(path)?);
        debug!("Reading config from {}", path.display());
    }
    let config: RuntimeConfig = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
    if config.max_concurrent_requests == 0 {
        return Err(Error::Config(
            "max_concurrent_requests must be at least 1".to_string(),
        ));
    }
    Ok(config)
}

/// Load any deserializable configuration from a single file
pub fn load_config_from_file<T, P>(path: P) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    file_figment(path.as_ref())?
        .extract()
        .map_err(|e| Error::Config(format!("Failed to load configuration from file: {}", e)))
}

/// Get a configuration value with priority: explicit > ENV > default
pub fn get_config_value<T>(explicit: Option<T>, env_var: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    // Priority 1: explicit value, usually a command line flag
    if let Some(value) = explicit {
        debug!("Using explicit {}", env_var);
        return value;
    }

    // Priority 2: environment variable
    if let Ok(env_str) = std::env::var(env_var) {
        match env_str.parse::<T>() {
            Ok(value) => {
                info!("Using {} from environment: {}", env_var, env_str);
                return value;
            },
            Err(e) => {
                warn!("Failed to parse {} from environment: {}", env_var, e);
            },
        }
    }

    // Priority 3: default value
    debug!("Using default value for {}", env_var);
    default
}
