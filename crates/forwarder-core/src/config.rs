//! Forwarder configuration.
//!
//! Resolution order: defaults → config file → environment variables, then a
//! single validation pass. Nothing is connected until validation succeeds.
//!
//! Config file location: $FORWARDER_CONFIG. Without it the bridge runs purely
//! from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::message::{QualityLevel, DEFAULT_SUFFIX_PROPERTY};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub pulsar: PulsarConfig,
    pub mqtt: MqttConfig,
    pub forwarding: ForwardingConfig,
    pub health_check: HealthCheckConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsarConfig {
    pub service_url: String,
    /// Regular expression over fully qualified topic names.
    pub topics_pattern: String,
    pub subscription: String,
    pub tls_validate_hostname: bool,
    pub oauth2: Option<OAuth2Config>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub issuer_url: String,
    /// JSON key file with the client credentials.
    pub key_path: PathBuf,
    pub audience: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub url: String,
    /// Base topic every message is published under.
    pub topic: String,
    pub client_id_prefix: String,
    /// Random alphanumeric characters appended to the prefix. 0 = none.
    pub client_id_suffix_length: usize,
    pub qos: QualityLevel,
    pub clean_session: bool,
    pub username_path: Option<PathBuf>,
    pub password_path: Option<PathBuf>,
    pub keep_alive_secs: u64,
    /// Capacity of the request queue between the client and its event loop.
    pub request_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Message property whose value is appended to the base topic.
    pub suffix_property: String,
    /// Max unconfirmed publishes. 0 = unbounded.
    pub max_in_flight: usize,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub host: String,
    /// 0 = OS-assigned.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on each teardown step.
    pub step_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PulsarConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            topics_pattern: String::new(),
            subscription: String::new(),
            tls_validate_hostname: true,
            oauth2: None,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            topic: String::new(),
            client_id_prefix: String::new(),
            client_id_suffix_length: 0,
            qos: QualityLevel::ExactlyOnceHop,
            clean_session: false,
            username_path: None,
            password_path: None,
            keep_alive_secs: 60,
            request_capacity: 64,
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            suffix_property: DEFAULT_SUFFIX_PROPERTY.to_string(),
            max_in_flight: 1024,
            stats_interval_secs: 60,
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 10,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("{0} must be defined")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("{0}")]
    Inconsistent(String),
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.into(),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(invalid(
            name,
            format!("expected \"true\" or \"false\", got {other:?}"),
        )),
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(name, format!("expected a non-negative integer, got {value:?}")))
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ForwarderConfig {
    /// Load config: defaults → $FORWARDER_CONFIG → env vars, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FORWARDER_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()
    }

    /// Parse a TOML file. Missing sections and fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Apply environment overrides, looking each variable up through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("MQTT_URL") {
            self.mqtt.url = v;
        }
        if let Some(v) = lookup("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID_PREFIX") {
            self.mqtt.client_id_prefix = v;
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID_SUFFIX_LENGTH") {
            self.mqtt.client_id_suffix_length = parse_number("MQTT_CLIENT_ID_SUFFIX_LENGTH", &v)?;
        }
        if let Some(v) = lookup("MQTT_QOS") {
            let level: u8 = parse_number("MQTT_QOS", &v)?;
            self.mqtt.qos =
                QualityLevel::try_from(level).map_err(|e| invalid("MQTT_QOS", e.to_string()))?;
        }
        if let Some(v) = lookup("MQTT_CLEAN_SESSION") {
            self.mqtt.clean_session = parse_bool("MQTT_CLEAN_SESSION", &v)?;
        }
        if let Some(v) = lookup("MQTT_USERNAME_PATH") {
            self.mqtt.username_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("MQTT_PASSWORD_PATH") {
            self.mqtt.password_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("MQTT_TOPIC_SUFFIX_PROPERTY") {
            self.forwarding.suffix_property = v;
        }
        if let Some(v) = lookup("PULSAR_SERVICE_URL") {
            self.pulsar.service_url = v;
        }
        if let Some(v) = lookup("PULSAR_TOPICS_PATTERN") {
            self.pulsar.topics_pattern = v;
        }
        if let Some(v) = lookup("PULSAR_SUBSCRIPTION") {
            self.pulsar.subscription = v;
        }
        if let Some(v) = lookup("PULSAR_TLS_VALIDATE_HOSTNAME") {
            self.pulsar.tls_validate_hostname = parse_bool("PULSAR_TLS_VALIDATE_HOSTNAME", &v)?;
        }
        // Empty counts as unset.
        let oauth2 = |name: &str| lookup(name).filter(|v| !v.is_empty());
        match (
            oauth2("PULSAR_OAUTH2_ISSUER_URL"),
            oauth2("PULSAR_OAUTH2_KEY_PATH"),
            oauth2("PULSAR_OAUTH2_AUDIENCE"),
        ) {
            (Some(issuer_url), Some(key_path), Some(audience)) => {
                self.pulsar.oauth2 = Some(OAuth2Config {
                    issuer_url,
                    key_path: PathBuf::from(key_path),
                    audience,
                });
            }
            (None, None, None) => {}
            _ => {
                return Err(ConfigError::Inconsistent(
                    "PULSAR_OAUTH2_ISSUER_URL, PULSAR_OAUTH2_KEY_PATH and \
                     PULSAR_OAUTH2_AUDIENCE must be defined together"
                        .to_string(),
                ))
            }
        }
        if let Some(v) = lookup("HEALTH_CHECK_PORT") {
            self.health_check.port = parse_number("HEALTH_CHECK_PORT", &v)?;
        }
        Ok(())
    }

    /// Check required fields and cross-field rules.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let required = [
            ("MQTT_URL", &self.mqtt.url),
            ("MQTT_TOPIC", &self.mqtt.topic),
            ("MQTT_CLIENT_ID_PREFIX", &self.mqtt.client_id_prefix),
            ("PULSAR_SERVICE_URL", &self.pulsar.service_url),
            ("PULSAR_TOPICS_PATTERN", &self.pulsar.topics_pattern),
            ("PULSAR_SUBSCRIPTION", &self.pulsar.subscription),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        if self.mqtt.username_path.is_some() != self.mqtt.password_path.is_some() {
            return Err(ConfigError::Inconsistent(
                "if either MQTT_USERNAME_PATH or MQTT_PASSWORD_PATH is defined, \
                 the other must be, too"
                    .to_string(),
            ));
        }

        if let Some(oauth2) = &self.pulsar.oauth2 {
            if oauth2.issuer_url.is_empty()
                || oauth2.key_path.as_os_str().is_empty()
                || oauth2.audience.is_empty()
            {
                return Err(ConfigError::Inconsistent(
                    "pulsar.oauth2 needs issuer_url, key_path and audience".to_string(),
                ));
            }
        }

        if let Err(e) = regex::Regex::new(&self.pulsar.topics_pattern) {
            return Err(invalid("PULSAR_TOPICS_PATTERN", e.to_string()));
        }

        if self.forwarding.stats_interval_secs == 0 {
            return Err(invalid("forwarding.stats_interval_secs", "must be positive"));
        }
        if self.shutdown.step_timeout_secs == 0 {
            return Err(invalid("shutdown.step_timeout_secs", "must be positive"));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(invalid("mqtt.request_capacity", "must be positive"));
        }

        Ok(self)
    }
}

impl MqttConfig {
    /// Username and password, read verbatim from their files.
    pub fn credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        let (Some(username_path), Some(password_path)) = (&self.username_path, &self.password_path)
        else {
            return Ok(None);
        };
        let read = |path: &PathBuf| {
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.clone(), e))
        };
        Ok(Some((read(username_path)?, read(password_path)?)))
    }
}
