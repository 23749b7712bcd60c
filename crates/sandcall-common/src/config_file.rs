//! Configuration file structures for sandcall.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ModuleSection`]: The module to run and how to call it

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{EntryPointShape, MountSpec, RuntimeConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = false
/// cache_dir = "/var/cache/sandcall"
///
/// [runtime.execution]
/// timeout_ms = 2000
///
/// [module]
/// path = "./guest.wasm"
/// entry_point = "main"
/// entry_shape = "with-identifier"
/// mounts = ["/srv/data:/data:ro"]
///
/// [module.env]
/// GREETING = "hello"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine + execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Module to load.
    #[serde(default)]
    pub module: ModuleSection,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// The module section of a config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleSection {
    /// Path to the WebAssembly module.
    #[serde(default)]
    pub path: Option<String>,

    /// Name of the exported entry point.
    #[serde(default = "defaults::entry_point")]
    pub entry_point: String,

    /// Argument shape of the entry point.
    #[serde(default)]
    pub entry_shape: EntryPointShape,

    /// Host directories to mount into the guest.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    /// Environment variables visible to the guest.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ModuleSection {
    fn default() -> Self {
        Self {
            path: None,
            entry_point: defaults::entry_point(),
            entry_shape: EntryPointShape::default(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

mod defaults {
    pub fn entry_point() -> String {
        "main".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.module.path.is_none());
        assert_eq!(config.module.entry_point, "main");
        assert_eq!(config.module.entry_shape, EntryPointShape::Default);
        assert!(config.module.mounts.is_empty());
        assert!(config.module.env.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [module]
            path = "./guest.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.module.path.as_deref(), Some("./guest.wasm"));
        assert_eq!(config.module.entry_point, "main");
        assert!(config.runtime.engine.pooling_allocator);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            pooling_allocator = false
            cache_dir = "/tmp/sandcall-cache"

            [runtime.execution]
            max_fuel = 5_000_000
            fuel_metering = true
            timeout_ms = 250

            [module]
            path = "./guest.wasm"
            entry_point = "handle"
            entry_shape = "with-identifier"
            mounts = ["/srv/data:/data:ro", "/tmp"]

            [module.env]
            GREETING = "hello"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(!config.runtime.engine.pooling_allocator);
        assert_eq!(
            config.runtime.engine.cache_dir.as_deref(),
            Some("/tmp/sandcall-cache")
        );
        assert_eq!(config.runtime.execution.max_fuel, 5_000_000);
        assert!(config.runtime.execution.fuel_metering);
        assert_eq!(config.runtime.execution.timeout_ms, 250);

        assert_eq!(config.module.entry_point, "handle");
        assert_eq!(config.module.entry_shape, EntryPointShape::WithIdentifier);
        assert_eq!(config.module.mounts.len(), 2);
        assert!(config.module.mounts[0].read_only);
        assert_eq!(config.module.mounts[1].guest_path, "/tmp");
        assert_eq!(config.module.env.get("GREETING").map(String::as_str), Some("hello"));
    }

    #[test]
    fn test_parse_bad_mount() {
        let toml = r#"
            [module]
            mounts = ["/srv:/data:bogus"]
        "#;
        assert!(ConfigFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
