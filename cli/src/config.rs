// Configuration management for the loopmix CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/loopmix/config.json
// - Linux: ~/.config/loopmix/config.json
// - Windows: %APPDATA%\loopmix\config.json

use anyhow::{Context, Result};
use loopmix_core::privacy::CoverTrafficPolicy;
use loopmix_core::relay::MailboxConfig;
use loopmix_core::{ClientConfig, RelayConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Participant directory (sled database); defaults to the data directory
    pub directory_path: Option<String>,

    /// Presence / metrics registry base URL
    pub registry_url: Option<String>,

    /// Mixes on every path before the provider
    pub hop_count: usize,

    /// Initial cover traffic policy of clients
    pub cover: CoverTrafficPolicy,

    /// Relay settings
    pub relay: RelaySettings,

    /// Client settings
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Upper bound on reading one inbound frame, in seconds
    pub read_timeout_secs: u64,

    /// Mailbox sweep interval, in seconds
    pub mailbox_sweep_secs: u64,

    /// Metrics report interval, in seconds
    pub metrics_interval_secs: u64,

    /// Per-recipient mailbox bound
    pub mailbox_capacity: usize,

    /// Mailbox entry lifetime, in seconds
    pub mailbox_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub fetch_enabled: bool,
    pub fetch_interval_ms: u64,
    pub topology_refresh_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory_path: None,
            registry_url: None,
            hop_count: 2,
            cover: CoverTrafficPolicy::default(),
            relay: RelaySettings::default(),
            client: ClientSettings::default(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        let mailbox = MailboxConfig::default();
        Self {
            read_timeout_secs: 10,
            mailbox_sweep_secs: 300,
            metrics_interval_secs: 60,
            mailbox_capacity: mailbox.max_stored_per_recipient,
            mailbox_ttl_secs: mailbox.ttl.as_secs(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            fetch_enabled: true,
            fetch_interval_ms: 1000,
            topology_refresh_secs: 30,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("loopmix");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("loopmix");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents = std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config = serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Directory database path: explicit config value or `<data_dir>/directory`
    pub fn directory_path(&self) -> Result<PathBuf> {
        match &self.directory_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("directory")),
        }
    }

    pub fn relay_config(&self, listen_addr: String, registry_url: Option<String>) -> RelayConfig {
        RelayConfig {
            listen_addr,
            read_timeout: Duration::from_secs(self.relay.read_timeout_secs),
            mailbox_sweep_interval: Duration::from_secs(self.relay.mailbox_sweep_secs),
            registry_url: registry_url.or_else(|| self.registry_url.clone()),
            metrics_interval: Duration::from_secs(self.relay.metrics_interval_secs),
        }
    }

    pub fn mailbox_config(&self) -> MailboxConfig {
        MailboxConfig {
            max_stored_per_recipient: self.relay.mailbox_capacity,
            ttl: Duration::from_secs(self.relay.mailbox_ttl_secs),
        }
    }

    pub fn client_config(&self, id: String, host: String, port: String, provider_id: String) -> ClientConfig {
        ClientConfig {
            id,
            host,
            port,
            provider_id,
            hop_count: self.hop_count,
            policy: self.cover.clone(),
            fetch_enabled: self.client.fetch_enabled,
            fetch_interval: Duration::from_millis(self.client.fetch_interval_ms),
            topology_refresh_interval: Duration::from_secs(self.client.topology_refresh_secs),
        }
    }

    /// Flattened key/value view for display
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "directory_path".to_string(),
                self.directory_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "registry_url".to_string(),
                self.registry_url.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            ("hop_count".to_string(), self.hop_count.to_string()),
            ("cover.loop_enabled".to_string(), self.cover.loop_enabled.to_string()),
            ("cover.drop_enabled".to_string(), self.cover.drop_enabled.to_string()),
            (
                "cover.rate_compliant_enabled".to_string(),
                self.cover.rate_compliant_enabled.to_string(),
            ),
            ("cover.desired_rate".to_string(), self.cover.desired_rate.to_string()),
            ("relay.read_timeout".to_string(), format!("{}s", self.relay.read_timeout_secs)),
            ("relay.mailbox_capacity".to_string(), self.relay.mailbox_capacity.to_string()),
            ("relay.mailbox_ttl".to_string(), format!("{}s", self.relay.mailbox_ttl_secs)),
            ("client.fetch_enabled".to_string(), self.client.fetch_enabled.to_string()),
            ("client.fetch_interval".to_string(), format!("{}ms", self.client.fetch_interval_ms)),
        ]
    }
}
