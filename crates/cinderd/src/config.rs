//! Node configuration loaded from an optional TOML file.

use cinder_consensus::validate_target;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub mining: MiningConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen: String,
    pub bootstrap: Vec<String>,
    pub max_peers: usize,
    pub target_outbound: usize,
    pub connect_timeout_secs: u64,
    pub discovery_interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5470".to_string(),
            bootstrap: vec![
                "127.0.0.1:5471".to_string(),
                "127.0.0.1:5472".to_string(),
                "127.0.0.1:5473".to_string(),
            ],
            max_peers: 64,
            target_outbound: 8,
            connect_timeout_secs: 5,
            discovery_interval_secs: 30,
            stale_after_secs: 120,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub miner_address: String,
    pub autostart: bool,
    pub interval_ms: u64,
    pub max_attempts: u64,
    pub difficulty_prefix: String,
    pub reward: f64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            miner_address: String::new(),
            autostart: false,
            interval_ms: 2_000,
            max_attempts: 200_000,
            difficulty_prefix: "0000".to_string(),
            reward: 10.0,
        }
    }
}

impl MiningConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub max_snapshots: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from("./data")),
            snapshot_interval_secs: 300,
            max_snapshots: 200,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let cfg: NodeConfig = toml::from_str(content)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mining = &self.mining;
        if !mining.reward.is_finite() || mining.reward <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "mining.reward must be positive, got {}",
                mining.reward
            )));
        }
        validate_target(&mining.difficulty_prefix)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if mining.interval_ms == 0 || mining.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "mining.interval_ms and mining.max_attempts must be non-zero".to_string(),
            ));
        }
        if mining.autostart && mining.miner_address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "mining.autostart requires mining.miner_address".to_string(),
            ));
        }
        let net = &self.network;
        if net.connect_timeout_secs == 0
            || net.discovery_interval_secs == 0
            || net.stale_after_secs == 0
        {
            return Err(ConfigError::Invalid(
                "network intervals must be non-zero".to_string(),
            ));
        }
        if net.max_peers == 0 {
            return Err(ConfigError::Invalid("network.max_peers must be non-zero".to_string()));
        }
        if self.storage.max_snapshots == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_snapshots must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = NodeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.network.listen, "0.0.0.0:5470");
        assert_eq!(cfg.network.bootstrap.len(), 3);
        assert_eq!(cfg.mining.difficulty_prefix, "0000");
        assert_eq!(cfg.storage.max_snapshots, 200);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = NodeConfig::from_toml(
            r#"
            [mining]
            reward = 2.5
            difficulty_prefix = "00"

            [network]
            bootstrap = []
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mining.reward, 2.5);
        assert_eq!(cfg.mining.max_attempts, 200_000);
        assert!(cfg.network.bootstrap.is_empty());
        assert_eq!(cfg.network.max_peers, 64);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = NodeConfig::default();
        cfg.mining.reward = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::default();
        cfg.mining.difficulty_prefix = "00X".into();
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::default();
        cfg.mining.autostart = true;
        assert!(cfg.validate().is_err());
        cfg.mining.miner_address = "alice".into();
        cfg.validate().unwrap();
    }
}
