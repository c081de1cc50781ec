// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "RustRabbitRPC.json";

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// Seconds to wait before reconnecting after the connection is lost.
    /// 0 disables auto-reconnect.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u64,
}

// Default values
fn default_url() -> String {
    "amqp://localhost:5672".to_string()
}
fn default_heartbeat() -> u64 {
    3
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>, heartbeat_seconds: u64) -> Self {
        Self {
            url: url.into(),
            heartbeat_seconds,
        }
    }

    /// Reads `MQ_HOST` and `MQ_HEARTBEAT`, loading a `.env` file first if
    /// one exists.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup("MQ_HOST").filter(|host| !host.trim().is_empty()) {
            config.url = normalize_url(host.trim());
        }

        if let Some(heartbeat) = lookup("MQ_HEARTBEAT") {
            config.heartbeat_seconds = heartbeat
                .trim()
                .parse()
                .with_context(|| format!("MQ_HEARTBEAT must be a number of seconds, got {:?}", heartbeat))?;
        }

        debug!(url = %config.url, heartbeat = config.heartbeat_seconds, "Loaded broker config from environment");
        Ok(config)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }

    fn validate(self) -> Result<Self> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("Configuration error: url cannot be empty"));
        }
        Ok(self)
    }
}

/// Hosts given without a scheme are assumed to be AMQP.
fn normalize_url(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("amqp://{}", host)
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    let config_dir_file = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", Path::new(CONFIG_FILE_NAME).to_path_buf()),
        ("Config directory", config_dir_file),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, config/ or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<BrokerConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> Result<BrokerConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    parse_config(&config_content)
}

fn parse_config(content: &str) -> Result<BrokerConfig> {
    let config: BrokerConfig = serde_json::from_str(content)
        .context("Configuration file contains invalid JSON or invalid fields")?;
    config.validate()
}

/// A config file if one can be found, otherwise the environment.
pub fn resolve_config() -> Result<BrokerConfig> {
    match find_config_file() {
        Ok(path) => {
            info!("Using configuration from {}", path.display());
            load_config_from(&path)
        }
        Err(_) => BrokerConfig::from_env(),
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&BrokerConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
