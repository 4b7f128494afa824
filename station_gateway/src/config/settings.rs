use crate::dispatch::message::{TriggerPriority, TriggerSource};
use crate::drivers::factory::DriverType;
use crate::error::{GatewayError, GatewayResult};
use crate::tags::structures::{DataType, Tag};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Optional trigger raised when a tag changes.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TriggerRule {
    pub station: String,
    #[serde(default)]
    pub source: TriggerSource,
    #[serde(default)]
    pub priority: TriggerPriority,
    #[serde(default)]
    pub debounce_key: Option<String>,
    /// Only fire when the value becomes truthy.
    #[serde(default = "default_true")]
    pub on_rising_edge: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TagConfig {
    pub name: String,        // Unique identifier for the tag
    pub address: String,     // Driver-specific address (e.g. "DB1.DBW4", "40001", "status/state")
    pub data_type: DataType,
    #[serde(default = "default_array_length")]
    pub array_length: usize,
    pub driver_code: String, // Name of the channel this tag belongs to
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub trigger: Option<TriggerRule>,
}

impl TagConfig {
    pub fn to_tag(&self) -> Tag {
        Tag {
            name: self.name.clone(),
            address: self.address.clone(),
            data_type: self.data_type,
            array_length: self.array_length.max(1),
            driver_code: self.driver_code.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub driver_type: DriverType,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconnect_backoff_max")]
    pub reconnect_backoff_max_ms: u64,
    /// Driver-specific settings, interpreted by the selected driver.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, driver_type: DriverType) -> Self {
        ChannelConfig {
            name: name.into(),
            driver_type,
            poll_interval_ms: default_poll_interval(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max(),
            settings: serde_json::Value::Null,
        }
    }

    /// Deserialize the settings blob into a driver's settings type.
    pub fn driver_settings<T: DeserializeOwned>(&self) -> GatewayResult<T> {
        let blob = match &self.settings {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(blob).map_err(|e| {
            GatewayError::Configuration(format!("channel '{}': invalid settings: {}", self.name, e))
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DispatcherSettings {
    #[serde(default = "default_high_capacity")]
    pub high_capacity: usize,
    #[serde(default = "default_normal_capacity")]
    pub normal_capacity: usize,
    #[serde(default = "default_debounce_window")]
    pub debounce_window_ms: u64,
    #[serde(default = "default_debounce_max_keys")]
    pub debounce_max_keys: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            high_capacity: default_high_capacity(),
            normal_capacity: default_normal_capacity(),
            debounce_window_ms: default_debounce_window(),
            debounce_max_keys: default_debounce_max_keys(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: default_bind(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append log lines to this file instead of standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)] // Make tags optional in the config file
    pub tags: Vec<TagConfig>,
}

impl Settings {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(config_path))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn save(&self, config_path: &Path) -> io::Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(config_path, toml_string)
    }

    /// Structural checks the loader cannot express through serde.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut names = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(GatewayError::Configuration(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            if channel.poll_interval_ms == 0 {
                return Err(GatewayError::Configuration(format!(
                    "channel '{}': poll_interval_ms must be positive",
                    channel.name
                )));
            }
        }
        for tag in &self.tags {
            if tag.array_length == 0 {
                return Err(GatewayError::Configuration(format!(
                    "tag '{}': array_length must be at least 1",
                    tag.name
                )));
            }
            if tag.data_type == DataType::Boolean && tag.array_length > 1 {
                return Err(GatewayError::Configuration(format!(
                    "tag '{}': boolean arrays are not supported",
                    tag.name
                )));
            }
        }
        if self.dispatcher.high_capacity == 0 || self.dispatcher.normal_capacity == 0 {
            return Err(GatewayError::Configuration(
                "dispatcher queue capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn trigger_rules(&self) -> HashMap<String, TriggerRule> {
        self.tags
            .iter()
            .filter_map(|t| t.trigger.clone().map(|rule| (t.name.clone(), rule)))
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_array_length() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_reconnect_backoff_max() -> u64 {
    30_000
}

fn default_high_capacity() -> usize {
    64
}

fn default_normal_capacity() -> usize {
    256
}

fn default_debounce_window() -> u64 {
    500
}

fn default_debounce_max_keys() -> usize {
    4096
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
