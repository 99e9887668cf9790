//! Controller settings (§6.3): TOML config file plus CLI overrides, merged
//! as CLI > file > defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dispatcher::COMMAND_TIMEOUT;
use crate::ota::{OTA_ACK_TIMEOUT_DEFAULT, OTA_MAX_RETRIES_DEFAULT};
use crate::registry::INACTIVE_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid device address in config: {0}")]
    InvalidDevice(String),
}

/// Which transport the controller should instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Serial link to a locally attached gateway.
    Edge,
    /// Remote message bus (MQTT-shaped) gateway.
    Cloud,
}

/// Full set of recognised controller options, mergeable from a TOML file
/// and then overridden by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub serial_port: Option<String>,
    pub serial_baudrate: u32,
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_use_tls: bool,
    pub network_id: u16,
    pub adapter: AdapterKind,
    /// Optional restriction list of target addresses, as canonical hex strings.
    pub devices: Option<Vec<String>>,
    pub verbose: bool,
    pub ota_timeout_secs: f64,
    pub ota_max_retries: u32,
    pub adapter_wait_timeout_secs: f64,
    /// "WIDTHxHEIGHT" in mm; informational only for the core.
    pub map_size: Option<String>,
}

/// CLI-supplied values to layer on top of the file/defaults merge. Every
/// field is optional (or a flag default of `false`) so that an unset CLI
/// flag never clobbers a value from the config file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub serial_port: Option<String>,
    pub serial_baudrate: Option<u32>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_use_tls: bool,
    /// Hex string, with or without a leading "0x".
    pub network_id: Option<String>,
    pub adapter: Option<AdapterKind>,
    pub devices: Option<Vec<String>>,
    pub verbose: bool,
    pub ota_timeout_secs: Option<f64>,
    pub ota_max_retries: Option<u32>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            serial_port: None,
            serial_baudrate: 115_200,
            mqtt_host: None,
            mqtt_port: 8883,
            mqtt_use_tls: true,
            network_id: 0,
            adapter: AdapterKind::Edge,
            devices: None,
            verbose: false,
            ota_timeout_secs: OTA_ACK_TIMEOUT_DEFAULT.as_secs_f64(),
            ota_max_retries: OTA_MAX_RETRIES_DEFAULT,
            adapter_wait_timeout_secs: 3.0,
            map_size: None,
        }
    }
}

impl ControllerSettings {
    /// Load defaults, then merge a TOML config file if `path` is given and exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        if let Some(path) = path {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                let from_file: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
                settings = from_file;
            }
        }
        Ok(settings)
    }

    /// Parsed `devices` addresses, or `None` if the restriction is unset.
    pub fn device_addresses(&self) -> Result<Option<Vec<u32>>, ConfigError> {
        match &self.devices {
            None => Ok(None),
            Some(list) => {
                let parsed = list
                    .iter()
                    .map(|text| {
                        crate::wire::parse_address(text)
                            .map_err(|_| ConfigError::InvalidDevice(text.clone()))
                    })
                    .collect::<Result<Vec<u32>, ConfigError>>()?;
                Ok(Some(parsed))
            }
        }
    }

    /// Apply CLI-supplied overrides on top of whatever was loaded from the
    /// config file/defaults. Follows CLI > file > defaults: only `Some`/
    /// non-default override fields take effect.
    pub fn apply_overrides(&mut self, overrides: CliOverrides) -> Result<(), ConfigError> {
        if let Some(v) = overrides.serial_port {
            self.serial_port = Some(v);
        }
        if let Some(v) = overrides.serial_baudrate {
            self.serial_baudrate = v;
        }
        if let Some(v) = overrides.mqtt_host {
            self.mqtt_host = Some(v);
        }
        if let Some(v) = overrides.mqtt_port {
            self.mqtt_port = v;
        }
        if overrides.mqtt_use_tls {
            self.mqtt_use_tls = true;
        }
        if let Some(v) = overrides.network_id {
            self.network_id = u16::from_str_radix(v.trim_start_matches("0x"), 16)
                .map_err(|_| ConfigError::InvalidDevice(v))?;
        }
        if let Some(v) = overrides.adapter {
            self.adapter = v;
        }
        if let Some(v) = overrides.devices {
            if !v.is_empty() {
                self.devices = Some(v);
            }
        }
        if overrides.verbose {
            self.verbose = true;
        }
        if let Some(v) = overrides.ota_timeout_secs {
            self.ota_timeout_secs = v;
        }
        if let Some(v) = overrides.ota_max_retries {
            self.ota_max_retries = v;
        }
        Ok(())
    }

    pub fn ota_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ota_timeout_secs)
    }

    pub fn adapter_wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.adapter_wait_timeout_secs)
    }

    pub fn inactive_timeout(&self) -> Duration {
        INACTIVE_TIMEOUT
    }

    pub fn command_timeout(&self) -> Duration {
        COMMAND_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.ota_max_retries, 3);
        assert_eq!(settings.adapter, AdapterKind::Edge);
        assert!(settings.devices.is_none());
    }

    #[test]
    fn load_missing_path_falls_back_to_defaults() {
        let settings = ControllerSettings::load(Some(Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(settings.network_id, 0);
    }

    #[test]
    fn parses_toml_overrides() {
        let dir = std::env::temp_dir().join(format!("swarmit-test-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        std::fs::write(
            &path,
            r#"
            serial_port = "/dev/ttyUSB0"
            network_id = 42
            adapter = "cloud"
            devices = ["0000ABCD"]
            ota_max_retries = 5
            "#,
        )
        .unwrap();

        let settings = ControllerSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.serial_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(settings.network_id, 42);
        assert_eq!(settings.adapter, AdapterKind::Cloud);
        assert_eq!(settings.ota_max_retries, 5);
        assert_eq!(settings.device_addresses().unwrap(), Some(vec![0x0000_ABCD]));

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }
}
