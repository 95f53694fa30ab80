//! Mapper configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `DEVMAPPER_*` environment variables (`DEVMAPPER_CAPACITY=64`,
//! `DEVMAPPER_PRELOAD_MODULES=debug,striped`).

use crate::error::{Error, Result};
use crate::slot::MAX_CAPACITY;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "DEVMAPPER";

/// Default number of slots, control slot included
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default control socket location
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/devmapper/dm.sock";

/// Mapper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Number of table slots, including the reserved control slot
    pub capacity: usize,
    /// Unix socket of the control endpoint
    pub control_socket: PathBuf,
    /// Root of the endpoint link tree; no links are made when unset
    pub endpoint_root: Option<PathBuf>,
    /// Directory searched for `dm_<name>` module libraries
    pub module_dir: Option<PathBuf>,
    /// Modules loaded at startup
    pub preload_modules: Vec<String>,
    /// Maximum concurrent control connections
    pub max_connections: usize,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            endpoint_root: None,
            module_dir: None,
            preload_modules: Vec::new(),
            max_connections: 64,
        }
    }
}

impl MapperConfig {
    /// Load defaults, the optional file at `path`, and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let defaults = Config::try_from(&Self::default()).map_err(config_error)?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("preload_modules"),
        );

        let config: Self = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(config_error)?;

        config.validate()?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the mapper cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 2 {
            return Err(Error::Config(format!(
                "capacity must be at least 2 (got {})",
                self.capacity
            )));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(Error::Config(format!(
                "capacity {} is too large (max: {})",
                self.capacity, MAX_CAPACITY
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".to_string()));
        }
        for name in &self.preload_modules {
            crate::names::check_module_name(name)
                .map_err(|e| Error::Config(format!("preload_modules: {}", e)))?;
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

fn config_error(e: config::ConfigError) -> Error {
    Error::Config(e.to_string())
}
