//! fleet.toml configuration parser.

use std::path::{Path, PathBuf};

use fleet_provider::LocalProviderConfig;
use fleet_supervisor::SupervisorConfig;
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub supervisor: SupervisorConfig,
    pub provider: ProviderConfig,
    pub api: ApiConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Keep all state in memory; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleet"),
            in_memory: false,
        }
    }
}

/// Which backend provisions nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// One child process per node.
    Local(LocalProviderConfig),
    /// Record calls only (dry run).
    Memory,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Local(LocalProviderConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_supervisor::RunnerMode;

    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.store.data_dir, PathBuf::from("/var/lib/fleet"));
        assert_eq!(config.supervisor.mode, RunnerMode::Remote);
        assert!(matches!(config.provider, ProviderConfig::Local(_)));
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
            [store]
            data_dir = "/tmp/fleet"

            [supervisor]
            mode = "local"
            tick_timeout = "30s"
            page_size = 200

            [supervisor.timeouts]
            pending = "5m"
            starting = "20s"

            [provider]
            kind = "local"
            command = "./runner"
            args = ["--serve"]
            base_port = 4000

            [api]
            port = 9000

            [log]
            json = true
        "#;
        let config: FleetConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.store.data_dir, PathBuf::from("/tmp/fleet"));
        assert_eq!(config.supervisor.mode, RunnerMode::Local);
        assert_eq!(config.supervisor.tick_timeout, Duration::from_secs(30));
        assert_eq!(config.supervisor.page_size, 200);
        let timeouts = config.supervisor.state_timeouts();
        assert_eq!(timeouts.pending, Duration::from_secs(300));
        assert_eq!(timeouts.starting, Duration::from_secs(20));
        let ProviderConfig::Local(local) = &config.provider else {
            panic!("expected local provider");
        };
        assert_eq!(local.command, "./runner");
        assert_eq!(local.args, vec!["--serve".to_string()]);
        assert_eq!(local.base_port, 4000);
        assert_eq!(local.host, "127.0.0.1");
        assert_eq!(config.api.port, 9000);
        assert!(config.log.json);
    }

    #[test]
    fn test_parse_memory_provider() {
        let config: FleetConfig = toml::from_str("[provider]\nkind = \"memory\"\n").unwrap();
        assert!(matches!(config.provider, ProviderConfig::Memory));
    }

    #[test]
    fn test_round_trip_defaults() {
        let toml_str = FleetConfig::default().to_toml_string().unwrap();
        let config: FleetConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.supervisor.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[api]\nport = 7000\n").unwrap();

        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.api.port, 7000);
        assert!(FleetConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
