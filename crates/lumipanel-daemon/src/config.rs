//! Configuration management.

#![allow(dead_code)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Display serial link configuration
    #[serde(default)]
    pub serial: SerialConfig,

    /// Manager server the panel reports to
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Display firmware/GUI update configuration
    #[serde(default)]
    pub update: UpdateConfig,
}

/// Display serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port the display is attached to
    #[serde(default = "default_serial_device")]
    pub device: String,

    /// sysfs GPIO value file switching display power, if wired
    #[serde(default)]
    pub power_gpio: Option<String>,
}

/// Manager server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Manager hostname or address
    #[serde(default = "default_manager_address")]
    pub address: String,

    /// Manager HTTP port
    #[serde(default = "default_manager_port")]
    pub port: u16,

    /// Path of the display GUI file on the manager
    #[serde(default = "default_tft_path")]
    pub tft_path: String,
}

/// Display update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Line speed used during the transfer
    #[serde(default = "default_update_baud")]
    pub baud_rate: u32,

    /// Upload protocol dialect: "v1"/"legacy" or "v2"
    #[serde(default = "default_update_protocol")]
    pub protocol: String,

    /// Run a display update before entering normal operation
    #[serde(default)]
    pub on_start: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            power_gpio: None,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            address: default_manager_address(),
            port: default_manager_port(),
            tft_path: default_tft_path(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_update_baud(),
            protocol: default_update_protocol(),
            on_start: false,
        }
    }
}

// Default value functions
fn default_serial_device() -> String {
    "/dev/ttyS1".to_string()
}

fn default_manager_address() -> String {
    "lumipanel-manager.local".to_string()
}

fn default_manager_port() -> u16 {
    8000
}

fn default_tft_path() -> String {
    "/download_tft".to_string()
}

fn default_update_baud() -> u32 {
    921_600
}

fn default_update_protocol() -> String {
    "v2".to_string()
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read configuration file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse configuration")?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), content).context("Failed to write configuration file")?;
        Ok(())
    }
}

impl ManagerConfig {
    /// URL of the display GUI file on the manager.
    pub fn tft_url(&self) -> String {
        format!("http://{}:{}{}", self.address, self.port, self.tft_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.serial.device, "/dev/ttyS1");
        assert_eq!(config.serial.power_gpio, None);
        assert_eq!(config.update.baud_rate, 921_600);
        assert_eq!(config.update.protocol, "v2");
        assert!(!config.update.on_start);
    }

    #[test]
    fn partial_sections_keep_unset_defaults() {
        let config: Config = toml::from_str(
            r#"
            [serial]
            device = "/dev/ttyUSB0"

            [update]
            on_start = true
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.update.baud_rate, 921_600);
        assert!(config.update.on_start);
    }

    #[test]
    fn tft_url_joins_manager_fields() {
        let config = Config::default();
        assert_eq!(
            config.manager.tft_url(),
            "http://lumipanel-manager.local:8000/download_tft"
        );
    }
}
