//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating cipherblob
//! settings from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `CIPHERBLOB_CONFIG`: Override config file path
//! - `CIPHERBLOB_STORAGE_DIR`: Override blob storage directory
//! - `CIPHERBLOB_BLOCK_SIZE`: Override split file block size (bytes)
//! - `CIPHERBLOB_MAX_DIR_ENTRIES`: Override entries per directory blob

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::dir_blob::{MAX_DIR_FAN_OUT, MAX_SIMPLE_DIR_ENTRIES, MIN_DIR_FAN_OUT};
use crate::file_blob::{BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "CIPHERBLOB_CONFIG";
pub const ENV_STORAGE_DIR: &str = "CIPHERBLOB_STORAGE_DIR";
pub const ENV_BLOCK_SIZE: &str = "CIPHERBLOB_BLOCK_SIZE";
pub const ENV_MAX_DIR_ENTRIES: &str = "CIPHERBLOB_MAX_DIR_ENTRIES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_dir: String,
    pub block_size: usize,
    pub max_simple_dir_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: "./blobs".to_string(),
            block_size: BLOCK_SIZE,
            max_simple_dir_entries: MAX_SIMPLE_DIR_ENTRIES,
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(storage_dir) = env::var(ENV_STORAGE_DIR) {
            debug!(storage_dir = %storage_dir, "overriding storage_dir from environment");
            self.storage_dir = storage_dir;
        }

        if let Some(block_size) = parse_env(ENV_BLOCK_SIZE) {
            debug!(block_size, "overriding block_size from environment");
            self.block_size = block_size;
        }

        if let Some(max_entries) = parse_env(ENV_MAX_DIR_ENTRIES) {
            debug!(max_entries, "overriding max_simple_dir_entries from environment");
            self.max_simple_dir_entries = max_entries;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage_dir.trim().is_empty() {
            anyhow::bail!("storage_dir cannot be empty");
        }

        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            anyhow::bail!(
                "block_size must be between {} and {} bytes, got {}",
                MIN_BLOCK_SIZE,
                MAX_BLOCK_SIZE,
                self.block_size
            );
        }

        // Readers refuse directory nodes wider than MAX_DIR_FAN_OUT
        if !(MIN_DIR_FAN_OUT..=MAX_DIR_FAN_OUT).contains(&self.max_simple_dir_entries) {
            anyhow::bail!(
                "max_simple_dir_entries must be between {} and {}, got {}",
                MIN_DIR_FAN_OUT,
                MAX_DIR_FAN_OUT,
                self.max_simple_dir_entries
            );
        }

        // Other block sizes still work but never share blocks with default stores
        if self.block_size != BLOCK_SIZE {
            warn!(
                block_size = self.block_size,
                default = BLOCK_SIZE,
                "non-default block_size, split files will not dedup against default stores"
            );
        }

        if self.storage_dir.contains("..") {
            warn!("storage_dir contains '..' - consider using absolute paths");
        }

        Ok(())
    }

    /// Create a new config with default policy for the given storage dir
    pub fn new(storage_dir: impl Into<String>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring invalid environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.block_size, BLOCK_SIZE);
        assert_eq!(cfg.max_simple_dir_entries, MAX_SIMPLE_DIR_ENTRIES);
        cfg.validate().expect("default config is valid");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::new("  ").validate().is_err());

        let mut cfg = Config::new("./blobs");
        cfg.block_size = MIN_BLOCK_SIZE - 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::new("./blobs");
        cfg.max_simple_dir_entries = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::new("./blobs");
        cfg.block_size = MIN_BLOCK_SIZE;
        cfg.max_simple_dir_entries = MIN_DIR_FAN_OUT;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unreadable_layouts() {
        let mut cfg = Config::new("./blobs");
        cfg.max_simple_dir_entries = 2_000_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::new("./blobs");
        cfg.block_size = MAX_BLOCK_SIZE + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::new("./blobs");
        cfg.block_size = MAX_BLOCK_SIZE;
        cfg.max_simple_dir_entries = MAX_DIR_FAN_OUT;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{ "storage_dir": "/srv/blobs" }"#).expect("write");

        let cfg = Config::load(path.to_str().expect("utf8 path")).expect("load");
        // env overrides may be set by the caller's environment
        if env::var(ENV_STORAGE_DIR).is_err() {
            assert_eq!(cfg.storage_dir, "/srv/blobs");
        }
        if env::var(ENV_MAX_DIR_ENTRIES).is_err() {
            assert_eq!(cfg.max_simple_dir_entries, MAX_SIMPLE_DIR_ENTRIES);
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("absent.json");
        assert!(Config::load(path.to_str().expect("utf8 path")).is_err());
    }

    #[test]
    fn test_parse_env_ignores_garbage() {
        env::set_var("CIPHERBLOB_TEST_PARSE_GOOD", " 4096 ");
        env::set_var("CIPHERBLOB_TEST_PARSE_BAD", "lots");

        assert_eq!(parse_env::<usize>("CIPHERBLOB_TEST_PARSE_GOOD"), Some(4096));
        assert_eq!(parse_env::<usize>("CIPHERBLOB_TEST_PARSE_BAD"), None);
        assert_eq!(parse_env::<usize>("CIPHERBLOB_TEST_PARSE_UNSET"), None);
    }
}
