// Configuration management for the rendezvous CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/rendezvous/config.json
// - Linux: ~/.config/rendezvous/config.json
// - Windows: %APPDATA%\rendezvous\config.json

use anyhow::{Context, Result};
use rendezvous_core::ExchangeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay addresses dialed when none are given on the command line
    pub relays: Vec<String>,

    /// Address `rendezvous relay` listens on
    pub listen_addr: String,

    /// Storage path for the identity database
    pub storage_path: Option<String>,

    /// Exchange settings
    pub exchange: ExchangeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            listen_addr: "0.0.0.0:4040".to_string(),
            storage_path: None,
            exchange: ExchangeConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("rendezvous");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("rendezvous");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where the identity database lives
    pub fn identity_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("identity")),
        }
    }

    /// Load config from the platform location, creating the default if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the platform location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Add a relay address; returns false if it was already present
    pub fn add_relay(&mut self, addr: String) -> bool {
        if self.relays.contains(&addr) {
            return false;
        }
        self.relays.push(addr);
        true
    }

    /// Remove a relay address; returns false if it was not present
    pub fn remove_relay(&mut self, addr: &str) -> bool {
        let before = self.relays.len();
        self.relays.retain(|r| r != addr);
        self.relays.len() != before
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "listen_addr" => {
                self.listen_addr = value.to_string();
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "secure" => {
                self.exchange.secure = value.parse().context("Invalid boolean value")?;
            }
            "enable_server" => {
                self.exchange.enable_server = value.parse().context("Invalid boolean value")?;
            }
            "call_timeout_secs" => {
                let secs: u64 = value.parse().context("Invalid number")?;
                if secs == 0 {
                    anyhow::bail!("call_timeout_secs must be at least 1");
                }
                self.exchange.call_timeout_secs = secs;
            }
            "identity_cache_size" => {
                self.exchange.identity_cache_size = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "listen_addr" => Some(self.listen_addr.clone()),
            "storage_path" => self.storage_path.clone(),
            "secure" => Some(self.exchange.secure.to_string()),
            "enable_server" => Some(self.exchange.enable_server.to_string()),
            "call_timeout_secs" => Some(self.exchange.call_timeout_secs.to_string()),
            "identity_cache_size" => Some(self.exchange.identity_cache_size.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("listen_addr".to_string(), self.listen_addr.clone()),
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("secure".to_string(), self.exchange.secure.to_string()),
            (
                "enable_server".to_string(),
                self.exchange.enable_server.to_string(),
            ),
            (
                "call_timeout_secs".to_string(),
                format!("{}s", self.exchange.call_timeout_secs),
            ),
            (
                "identity_cache_size".to_string(),
                self.exchange.identity_cache_size.to_string(),
            ),
            ("relays".to_string(), self.relays.len().to_string()),
        ]
    }
}

// ===== TESTS =====
