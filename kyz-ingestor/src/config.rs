use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::{
    error::ConfigError,
    transform::{LocalZone, MINUTES_PER_DAY},
};

pub const DEFAULT_TOPIC: &str = "pri/energy/kyz/interval";
pub const DEFAULT_CONFIG_PATH: &str = "kyz-ingestor.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    /// Name of the environment variable holding the broker password.
    pub password_env: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

impl MqttConfig {
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub uri: Option<String>,
    /// Name of the environment variable holding the connection URI.
    pub uri_env: Option<String>,
    #[serde(default = "default_connect_backoff_base_ms")]
    pub connect_backoff_base_ms: u64,
    #[serde(default = "default_connect_backoff_max_ms")]
    pub connect_backoff_max_ms: u64,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl StoreConfig {
    /// Resolve the connection URI, preferring the inline value over `uri_env`.
    pub fn resolve_uri(&self) -> Result<String, ConfigError> {
        if let Some(uri) = self.uri.as_ref().filter(|u| !u.trim().is_empty()) {
            return Ok(uri.clone());
        }
        match &self.uri_env {
            Some(name) => match std::env::var(name) {
                Ok(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(ConfigError::Missing(format!("environment variable {name}"))),
            },
            None => Err(ConfigError::Missing("store.uri".to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_interval_minutes")]
    pub minutes: i64,
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: i64,
    /// Only needed for pulse payloads; canonical-only deployments may omit it.
    pub pulses_per_kwh: Option<f64>,
    /// IANA zone name (e.g. `America/Chicago`) boundaries are counted in.
    /// Defaults to the host's local zone.
    pub timezone: Option<String>,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            minutes: default_interval_minutes(),
            grace_seconds: default_grace_seconds(),
            pulses_per_kwh: None,
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub interval: IntervalConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "kyz-sql-ingestor".to_string()
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_reconnect_min_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_connect_backoff_base_ms() -> u64 {
    1_000
}

fn default_connect_backoff_max_ms() -> u64 {
    60_000
}

fn default_write_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_interval_minutes() -> i64 {
    15
}

fn default_grace_seconds() -> i64 {
    30
}

impl AppConfig {
    /// Load from `path`, or from `KYZ_CONFIG`, or from `kyz-ingestor.toml`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_string_lossy().into_owned(),
            None => std::env::var("KYZ_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
        };
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let cfg = Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path, source },
            other => other,
        })?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;
        if mqtt.host.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.host".to_string()));
        }
        if mqtt.port == 0 {
            return Err(ConfigError::invalid("mqtt.port", "must be greater than zero"));
        }
        if mqtt.keepalive_secs == 0 {
            return Err(ConfigError::invalid("mqtt.keepalive_secs", "must be greater than zero"));
        }
        if mqtt.topic.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.topic".to_string()));
        }
        if mqtt.reconnect_min_secs == 0 || mqtt.reconnect_min_secs > mqtt.reconnect_max_secs {
            return Err(ConfigError::invalid(
                "mqtt.reconnect_min_secs",
                "must be greater than zero and not exceed mqtt.reconnect_max_secs",
            ));
        }

        self.store.resolve_uri()?;
        if self.store.write_attempts == 0 {
            return Err(ConfigError::invalid("store.write_attempts", "must be at least 1"));
        }

        let interval = &self.interval;
        if interval.minutes <= 0 || interval.minutes > MINUTES_PER_DAY {
            return Err(ConfigError::invalid("interval.minutes", "must be between 1 and 1440"));
        }
        if interval.grace_seconds < 0 {
            return Err(ConfigError::invalid("interval.grace_seconds", "must be zero or greater"));
        }
        if let Some(ppk) = interval.pulses_per_kwh {
            if !ppk.is_finite() || ppk <= 0.0 {
                return Err(ConfigError::invalid(
                    "interval.pulses_per_kwh",
                    "must be greater than zero",
                ));
            }
        } else {
            tracing::warn!("interval.pulses_per_kwh not set; pulse payloads will be rejected");
        }
        LocalZone::from_config(interval)?;

        Ok(())
    }
}
