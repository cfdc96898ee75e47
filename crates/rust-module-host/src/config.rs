//! Host configuration
//!
//! Defaults, then an optional YAML file named by `RUST_MODULE_HOST_CONFIG`,
//! then `RUST_MODULE_HOST_*` environment variables.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const ENV_PREFIX: &str = "RUST_MODULE_HOST_";
const CONFIG_FILE_VAR: &str = "RUST_MODULE_HOST_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory scanned and watched for module libraries
    pub modules_dir: PathBuf,

    /// Directory for the SQLite database
    pub data_dir: PathBuf,

    /// Path prefix in front of every module, empty for none
    pub base_path: String,

    /// Modules loaded first at startup, in this order
    pub module_order: Vec<String>,

    pub port: u16,

    /// Default reply timeout for module requests
    pub message_timeout_secs: u64,

    /// Request body limit in bytes
    pub max_body_size: usize,

    pub session_timeout_mins: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            modules_dir: PathBuf::from("./modules"),
            data_dir: PathBuf::from("./data"),
            base_path: String::new(),
            module_order: Vec::new(),
            port: 8080,
            message_timeout_secs: 2,
            max_body_size: 1024 * 1024,
            session_timeout_mins: 30,
        }
    }
}

impl HostConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_FILE_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|name| lookup(&format!("{}{}", ENV_PREFIX, name)));
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("MODULES_DIR") {
            self.modules_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(base) = var("BASE_PATH") {
            self.base_path = base;
        }
        if let Some(order) = var("MODULE_ORDER") {
            self.module_order = order
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }
        if let Some(port) = var("PORT").and_then(|s| s.parse().ok()) {
            self.port = port;
        }
        if let Some(secs) = var("MESSAGE_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.message_timeout_secs = secs;
        }
        if let Some(size) = var("MAX_BODY_SIZE").and_then(|s| s.parse().ok()) {
            self.max_body_size = size;
        }
        if let Some(mins) = var("SESSION_TIMEOUT_MINS").and_then(|s| s.parse().ok()) {
            self.session_timeout_mins = mins;
        }
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_mins * 60)
    }
}
