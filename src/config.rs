//! Code for the configuration of the application.

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolTimeouts;

/// The configuration of the application.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Serial link settings.
    pub serial: SerialConfig,

    /// How long to wait for devices to answer.
    pub protocol: ProtocolTimeouts,

    /// Port rescanning.
    pub discovery: DiscoveryConfig,

    /// Payload retention.
    pub retention: RetentionConfig,

    /// Human names for known devices.
    pub fabricators: Vec<FabricatorConfig>,

    /// Where exported payloads are written.
    pub export_dir: Option<PathBuf>,
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &PathBuf) -> Result<Self> {
        let config = std::fs::read_to_string(file)?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    pub fn from_str(config: &str) -> Result<Self> {
        Ok(toml::from_str(config)?)
    }

    /// Configured name of the device with `hardware_id`.
    pub fn name_for(&self, hardware_id: &str) -> Option<&str> {
        self.fabricators
            .iter()
            .find(|f| f.hardware_id == hardware_id)
            .map(|f| f.name.as_str())
    }

    /// Export directory, defaulting to `exports` under the system temp
    /// directory.
    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("fabricator-api").join("exports"))
    }
}

/// Serial link settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate for models that don't name one.
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { baud: 115200 }
    }
}

/// Port rescanning.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Seconds between scans.
    pub interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl DiscoveryConfig {
    /// Time between scans.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Payload retention.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age, in days, after which finished jobs lose their payload.
    pub max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_age_days: 182 }
    }
}

impl RetentionConfig {
    /// Age after which finished jobs lose their payload.
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_age_days))
    }
}

/// Name of one known device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FabricatorConfig {
    /// Hardware id as discovery reports it.
    pub hardware_id: String,

    /// Human name.
    pub name: String,
}
