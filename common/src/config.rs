use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub ack_timeout_ms: u64,
    pub discharge_hold_ms: u64,
    pub tick_interval_ms: u64,
    pub status_publish_interval_ms: u64,
    pub stats_interval_ms: u64,
    pub on_marker: String,
    pub off_marker: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 1_500,
            discharge_hold_ms: 1_000,
            tick_interval_ms: 100,
            status_publish_interval_ms: 10_000,
            stats_interval_ms: 60_000,
            on_marker: "ON".to_string(),
            off_marker: "OFF".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn sanitize(&mut self) {
        self.ack_timeout_ms = self.ack_timeout_ms.clamp(200, 30_000);
        self.discharge_hold_ms = self.discharge_hold_ms.clamp(100, 5_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, self.ack_timeout_ms);
        self.status_publish_interval_ms = self.status_publish_interval_ms.max(1_000);
        self.stats_interval_ms = self.stats_interval_ms.max(1_000);

        if self.on_marker.is_empty() {
            self.on_marker = "ON".to_string();
        }
        if self.off_marker.is_empty() {
            self.off_marker = "OFF".to_string();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    /// Loads a runtime config from a JSON file, sanitizing timings on the
    /// way in. Startup-only; settings are never written back.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut runtime: Self =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        runtime.bridge.sanitize();
        Ok(runtime)
    }
}
