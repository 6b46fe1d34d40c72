use anyhow::{Context, Result};
use nostr_sdk::Keys;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub relay: RelayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_relay_name")]
    pub name: String,
    #[serde(default = "default_relay_description")]
    pub description: String,
    /// Public host name, used to check the `relay` tag of AUTH events.
    pub domain: String,
    /// nsec or hex. Falls back to `RELAY_PRIVKEY`.
    pub secret_key: Option<String>,
    pub contact: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory holding `community.db` and `public.db`.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_max_past_secs")]
    pub max_past_secs: u64,
    #[serde(default = "default_max_future_secs")]
    pub max_future_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_past_secs: default_max_past_secs(),
            max_future_secs: default_max_future_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_relay_name() -> String {
    "Communities relay".to_string()
}

fn default_relay_description() -> String {
    "A relay for communities".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:5577".to_string()
}

fn default_storage_path() -> String {
    "./db".to_string()
}

fn default_max_past_secs() -> u64 {
    60
}

fn default_max_future_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    communities_core::DEFAULT_QUEUE_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        let content = fs::read_to_string(expanded_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_toml(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML config")
    }

    /// Environment fallbacks: `RELAY_PRIVKEY` when no key is configured,
    /// `PORT` replacing the port of the bind address.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.relay.secret_key.is_none() {
            self.relay.secret_key = var("RELAY_PRIVKEY");
        }

        if let Some(port) = var("PORT") {
            let host = self
                .server
                .bind
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind = format!("{host}:{port}");
        }
    }

    pub fn keys(&self) -> Result<Keys> {
        let secret = self
            .relay
            .secret_key
            .as_deref()
            .context("No relay secret key: set relay.secret_key or RELAY_PRIVKEY")?;
        Keys::parse(secret).map_err(|e| anyhow::anyhow!("Failed to parse relay secret key: {}", e))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }

    pub fn community_db(&self) -> PathBuf {
        PathBuf::from(&self.storage.path).join("community.db")
    }

    pub fn public_db(&self) -> PathBuf {
        PathBuf::from(&self.storage.path).join("public.db")
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.domain.trim().is_empty() {
            anyhow::bail!("relay.domain must not be empty");
        }

        self.keys()?;
        self.bind_addr()?;

        if self.policy.queue_capacity == 0 {
            anyhow::bail!("policy.queue_capacity must be greater than zero");
        }

        Ok(())
    }

    pub fn expand_paths(&mut self) -> Result<()> {
        self.storage.path = shellexpand::tilde(&self.storage.path).to_string();
        Ok(())
    }
}
