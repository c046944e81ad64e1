use clap::ArgMatches;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::utils::error::TelemetryError;

pub const DEFAULT_CONFIG_PATH: &str = "config/wellhead.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub ingestion: IngestionConfig,
    pub simulation: SimulationConfig,
    pub database: SqliteConfig,
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub port: u16,
    pub register_count: usize,
    /// Seconds between register map rebuilds; 0 keeps the startup map.
    pub map_refresh_seconds: u64,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Simulated,
    Process { program: String, args: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub poll_interval_seconds: u64,
    pub request_timeout_ms: u64,
    pub reconnect_backoff_seconds: u64,
    pub reload_map_on_reconnect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub interval_seconds: u64,
    pub excursion_probability: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
    pub enable_wal: bool,
    pub busy_timeout_ms: u64,
    pub sync_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub wellhead_count: u32,
    pub registers_per_wellhead: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5020,
            register_count: 65_536,
            map_refresh_seconds: 0,
            source: SourceConfig::Simulated,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5020,
            unit_id: 1,
            poll_interval_seconds: 10,
            request_timeout_ms: 3_000,
            reconnect_backoff_seconds: 10,
            reload_map_on_reconnect: false,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            excursion_probability: 0.10,
            seed: None,
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: "data/wellhead_telemetry.db".to_string(),
            max_connections: 5,
            connection_timeout_seconds: 30,
            enable_wal: true,
            busy_timeout_ms: 30_000,
            sync_mode: "NORMAL".to_string(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            wellhead_count: 5,
            registers_per_wellhead: 50,
        }
    }
}

impl GatewayConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn map_refresh(&self) -> Option<Duration> {
        (self.map_refresh_seconds > 0).then(|| Duration::from_secs(self.map_refresh_seconds))
    }
}

impl IngestionConfig {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_seconds)
    }
}

impl SimulationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Config {
    /// Loads `path` when it exists, otherwise starts from defaults. Environment
    /// overrides are applied either way.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            info!("📄 Loading configuration from {}", path.display());
            Self::from_file(path)?
        } else {
            debug!("No configuration file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TelemetryError::ConfigError(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), TelemetryError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TelemetryError::ConfigError(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content).map_err(|e| {
            TelemetryError::ConfigError(format!(
                "Failed to write {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// `MODBUS_HOST`, `MODBUS_PORT`, `WELLHEAD_DB_PATH`, `POLL_INTERVAL`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MODBUS_HOST") {
            self.ingestion.host = host;
        }
        if let Some(port) = lookup("MODBUS_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.ingestion.port = port;
                    self.gateway.port = port;
                }
                Err(_) => warn!("Ignoring invalid MODBUS_PORT value: {}", port),
            }
        }
        if let Some(path) = lookup("WELLHEAD_DB_PATH") {
            self.database.database_path = path;
        }
        if let Some(interval) = lookup("POLL_INTERVAL") {
            match interval.parse::<u64>() {
                Ok(seconds) => self.ingestion.poll_interval_seconds = seconds,
                Err(_) => warn!("Ignoring invalid POLL_INTERVAL value: {}", interval),
            }
        }
    }

    pub fn apply_matches(&mut self, matches: &ArgMatches) {
        if let Some(path) = matches.get_one::<String>("database") {
            self.database.database_path = path.clone();
        }
        if let Some(host) = matches.get_one::<String>("host") {
            self.ingestion.host = host.clone();
        }
        if let Some(&port) = matches.get_one::<u16>("port") {
            self.ingestion.port = port;
            self.gateway.port = port;
        }
        if let Some(&interval) = matches.get_one::<u64>("interval") {
            self.ingestion.poll_interval_seconds = interval;
            self.simulation.interval_seconds = interval;
        }
        if let Some(&seed) = matches.get_one::<u64>("seed") {
            self.simulation.seed = Some(seed);
        }
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.ingestion.poll_interval_seconds == 0 {
            return Err(TelemetryError::ConfigError(
                "ingestion.poll_interval_seconds must be positive".to_string(),
            ));
        }
        if self.ingestion.request_timeout_ms == 0 {
            return Err(TelemetryError::ConfigError(
                "ingestion.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.simulation.interval_seconds == 0 {
            return Err(TelemetryError::ConfigError(
                "simulation.interval_seconds must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.simulation.excursion_probability) {
            return Err(TelemetryError::ConfigError(format!(
                "simulation.excursion_probability {} is not a probability",
                self.simulation.excursion_probability
            )));
        }
        if !(2..=65_536).contains(&self.gateway.register_count) {
            return Err(TelemetryError::ConfigError(format!(
                "gateway.register_count {} must be within 2..=65536",
                self.gateway.register_count
            )));
        }
        if let SourceConfig::Process { program, .. } = &self.gateway.source {
            if program.trim().is_empty() {
                return Err(TelemetryError::ConfigError(
                    "gateway.source.program must not be empty".to_string(),
                ));
            }
        }
        if self.provisioning.registers_per_wellhead < 2 {
            return Err(TelemetryError::ConfigError(
                "provisioning.registers_per_wellhead must hold at least one register pair"
                    .to_string(),
            ));
        }
        if self.database.database_path.is_empty() {
            return Err(TelemetryError::ConfigError(
                "database.database_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.ingestion.server_address(), "127.0.0.1:5020");
        assert_eq!(config.ingestion.reconnect_backoff(), Duration::from_secs(10));
        assert_eq!(config.simulation.excursion_probability, 0.10);
        assert!(config.gateway.map_refresh().is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [ingestion]
            host = "gateway"
            poll_interval_seconds = 30

            [gateway.source]
            kind = "process"
            program = "wellhead-telemetry"
            args = ["simulate"]
            "#,
        )
        .unwrap();

        assert_eq!(config.ingestion.host, "gateway");
        assert_eq!(config.ingestion.poll_interval_seconds, 30);
        assert_eq!(config.ingestion.port, 5020);
        assert_eq!(
            config.gateway.source,
            SourceConfig::Process {
                program: "wellhead-telemetry".to_string(),
                args: vec!["simulate".to_string()],
            }
        );
        assert_eq!(config.provisioning.registers_per_wellhead, 50);
    }

    #[test]
    fn test_serialized_defaults_parse_back() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.gateway.source, SourceConfig::Simulated);
        assert_eq!(parsed.database.database_path, "data/wellhead_telemetry.db");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MODBUS_HOST", "10.0.0.5"),
            ("MODBUS_PORT", "1502"),
            ("WELLHEAD_DB_PATH", ":memory:"),
            ("POLL_INTERVAL", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.ingestion.server_address(), "10.0.0.5:1502");
        assert_eq!(config.gateway.port, 1502);
        assert_eq!(config.database.database_path, ":memory:");
        // Invalid values leave the default in place.
        assert_eq!(config.ingestion.poll_interval_seconds, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.ingestion.poll_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.simulation.excursion_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.source = SourceConfig::Process {
            program: " ".to_string(),
            args: Vec::new(),
        };
        assert!(config.validate().is_err());
    }
}
