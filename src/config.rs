use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Drift parameters for one sensor
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct DriftCondition {
    pub window_size: usize,
    pub deviation_factor: f64,
    pub rate_of_change: f64,
}

pub type DriftConditions = HashMap<String, DriftCondition>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub sensors: Vec<SensorConfig>,
    pub mqtt: MqttConfig,
    pub email: Option<EmailConfig>,
    pub drift_conditions: DriftConditions,
    pub monitor: MonitorConfig,
    pub publisher: PublisherConfig,
    /// Non-fatal findings from loading, to be logged once logging is up
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub name: String,
    pub base_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailConfig {
    pub sender_email: String,
    pub receiver_email: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub sender_password: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_storage_retries")]
    pub storage_retries: u32,
    #[serde(default = "default_storage_retry_delay")]
    pub storage_retry_delay_ms: u64,
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: default_database(),
            connect_retries: default_connect_retries(),
            connect_retry_delay_secs: default_connect_retry_delay(),
            connect_timeout_secs: default_connect_timeout(),
            storage_retries: default_storage_retries(),
            storage_retry_delay_ms: default_storage_retry_delay(),
            notify_timeout_secs: default_notify_timeout(),
        }
    }
}

impl MonitorConfig {
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_retries, Duration::from_secs(self.connect_retry_delay_secs))
    }

    pub fn storage_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.storage_retries, Duration::from_millis(self.storage_retry_delay_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherConfig {
    #[serde(default = "default_publish_interval")]
    pub interval_secs: u64,
    /// Relative spread around each sensor's base value
    #[serde(default = "default_variation")]
    pub variation: f64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_publish_interval(),
            variation: default_variation(),
        }
    }
}

// On-disk shape. Every required field is optional here so validation can
// report all problems at once instead of failing on the first.

#[derive(Debug, Deserialize, Default)]
pub struct RawConfig {
    pub sensors: Option<Vec<RawSensor>>,
    pub mqtt: Option<RawMqtt>,
    pub email: Option<RawEmail>,
    #[serde(default)]
    pub failure_conditions: Vec<FailureCondition>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawSensor {
    pub name: Option<String>,
    pub base_value: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawMqtt {
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawEmail {
    pub sender_email: Option<String>,
    pub receiver_email: Option<String>,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub sender_password: Option<String>,
}

/// One entry of `failure_conditions`. Only `drift_conditions` matters to the
/// monitor; the threshold entries belong to the batch data generator.
#[derive(Debug, Deserialize, Default)]
pub struct FailureCondition {
    pub name: Option<String>,
    pub drift_conditions: Option<HashMap<String, DriftCondition>>,
}

impl Config {
    /// Read, expand, override from the process environment and validate
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::from_file(path)?;
        raw.apply_env_overrides(|key| std::env::var(key).ok())?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let sensors = match raw.sensors {
            None => {
                errors.push("Missing 'sensors' section in configuration".to_string());
                Vec::new()
            }
            Some(sensors) => sensors
                .into_iter()
                .enumerate()
                .filter_map(|(i, s)| match s.name {
                    Some(name) if s.base_value.is_some_and(|b| !b.is_finite()) => {
                        errors.push(format!("Sensor '{name}' has a non-finite base_value"));
                        None
                    }
                    Some(name) => Some(SensorConfig { name, base_value: s.base_value }),
                    None => {
                        errors.push(format!("Sensor at index {i} is missing 'name'"));
                        None
                    }
                })
                .collect(),
        };

        let mqtt = match raw.mqtt {
            None => {
                errors.push("Missing 'mqtt' section in configuration".to_string());
                None
            }
            Some(m) => {
                let keep_alive_secs = m.keep_alive_secs.unwrap_or(60);
                let broker = require(m.broker, "broker", "MQTT", &mut errors);
                let port = require(m.port, "port", "MQTT", &mut errors);
                let topic = require(m.topic, "topic", "MQTT", &mut errors);
                match (broker, port, topic) {
                    (Some(broker), Some(port), Some(topic)) => Some(MqttConfig {
                        broker,
                        port,
                        topic,
                        username: m.username.filter(|u| !u.is_empty()),
                        password: m.password.filter(|p| !p.is_empty()),
                        client_id: m.client_id.filter(|c| !c.is_empty()),
                        keep_alive_secs,
                    }),
                    _ => None,
                }
            }
        };

        let email = raw.email.and_then(|e| {
            let sender_email = require(e.sender_email, "sender_email", "email", &mut errors);
            let receiver_email = require(e.receiver_email, "receiver_email", "email", &mut errors);
            let smtp_server = require(e.smtp_server, "smtp_server", "email", &mut errors);
            let smtp_port = require(e.smtp_port, "smtp_port", "email", &mut errors);
            Some(EmailConfig {
                sender_email: sender_email?,
                receiver_email: receiver_email?,
                smtp_server: smtp_server?,
                smtp_port: smtp_port?,
                sender_password: e.sender_password.filter(|p| !p.is_empty()),
            })
        });

        let mut warnings = Vec::new();
        let drift_conditions = merge_drift_conditions(raw.failure_conditions, &mut warnings);
        for (sensor, c) in &drift_conditions {
            if c.window_size == 0 {
                errors.push(format!("Drift condition for '{sensor}' has window_size 0"));
            }
            if !(c.deviation_factor.is_finite() && c.deviation_factor >= 0.0) {
                errors.push(format!("Drift condition for '{sensor}' has invalid deviation_factor"));
            }
            if c.rate_of_change.is_nan() || c.rate_of_change < 0.0 {
                errors.push(format!("Drift condition for '{sensor}' has invalid rate_of_change"));
            }
        }

        if raw.monitor.connect_retries == 0 {
            errors.push("'monitor.connect_retries' must be at least 1".to_string());
        }
        if raw.monitor.storage_retries == 0 {
            errors.push("'monitor.storage_retries' must be at least 1".to_string());
        }
        if raw.publisher.interval_secs == 0 {
            errors.push("'publisher.interval_secs' must be at least 1".to_string());
        }
        if !(raw.publisher.variation.is_finite() && raw.publisher.variation >= 0.0) {
            errors.push("'publisher.variation' must be a finite, non-negative fraction".to_string());
        }

        match mqtt {
            Some(mqtt) if errors.is_empty() => Ok(Self {
                sensors,
                mqtt,
                email,
                drift_conditions,
                monitor: raw.monitor,
                publisher: raw.publisher,
                warnings,
            }),
            _ => Err(ConfigError::Invalid(errors)),
        }
    }
}

impl RawConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let is_toml = Path::new(path).extension().is_some_and(|ext| ext == "toml");
        Self::parse(&content, is_toml).map_err(|message| ConfigError::Parse {
            path: path.to_string(),
            message,
        })
    }

    /// Parse TOML or JSON after `${VAR}` expansion
    pub fn parse(content: &str, is_toml: bool) -> Result<Self, String> {
        let expanded = expand_env_vars(content);
        if is_toml {
            toml::from_str(&expanded).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&expanded).map_err(|e| e.to_string())
        }
    }

    /// Environment overrides for broker and SMTP settings.
    ///
    /// SMTP variables only apply when the file already has an `email` block,
    /// so setting them alone never enables notification.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();

        if let Some(mqtt) = self.mqtt.as_mut() {
            if let Some(v) = lookup("MQTT_BROKER") {
                mqtt.broker = Some(v);
            }
            if let Some(v) = lookup("MQTT_PORT") {
                mqtt.port = parse_port("MQTT_PORT", &v, &mut errors).or(mqtt.port);
            }
            if let Some(v) = lookup("MQTT_USERNAME") {
                mqtt.username = Some(v);
            }
            if let Some(v) = lookup("MQTT_PASSWORD") {
                mqtt.password = Some(v);
            }
        }

        if let Some(email) = self.email.as_mut() {
            if let Some(v) = lookup("SMTP_EMAIL") {
                email.sender_email = Some(v);
            }
            if let Some(v) = lookup("SMTP_PASSWORD") {
                email.sender_password = Some(v);
            }
            if let Some(v) = lookup("SMTP_SERVER") {
                email.smtp_server = Some(v);
            }
            if let Some(v) = lookup("SMTP_PORT") {
                email.smtp_port = parse_port("SMTP_PORT", &v, &mut errors).or(email.smtp_port);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Drift conditions from every `failure_conditions` entry. Later entries win.
fn merge_drift_conditions(entries: Vec<FailureCondition>, warnings: &mut Vec<String>) -> DriftConditions {
    let mut merged = DriftConditions::new();
    for entry in entries {
        let Some(conditions) = entry.drift_conditions else {
            continue;
        };
        for (sensor, condition) in conditions {
            if merged.insert(sensor.clone(), condition).is_some() {
                warnings.push(format!(
                    "Drift condition for '{sensor}' redefined by entry '{}', later entry wins",
                    entry.name.as_deref().unwrap_or("<unnamed>")
                ));
            }
        }
    }
    merged
}

fn require<T>(value: Option<T>, field: &str, section: &str, errors: &mut Vec<String>) -> Option<T> {
    if value.is_none() {
        errors.push(format!("Missing '{field}' in {section} configuration"));
    }
    value
}

fn parse_port(var: &str, value: &str, errors: &mut Vec<String>) -> Option<u16> {
    match value.trim().parse() {
        Ok(port) => Some(port),
        Err(_) => {
            errors.push(format!("{var} is not a valid port: {value:?}"));
            None
        }
    }
}

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern is valid"));

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .to_string()
}

fn default_log_level() -> String { "info".to_string() }
fn default_database() -> String { "scada_alerts.db".to_string() }
fn default_connect_retries() -> u32 { 5 }
fn default_connect_retry_delay() -> u64 { 5 }
fn default_connect_timeout() -> u64 { 10 }
fn default_storage_retries() -> u32 { 3 }
fn default_storage_retry_delay() -> u64 { 1000 }
fn default_notify_timeout() -> u64 { 30 }
fn default_publish_interval() -> u64 { 2 }
fn default_variation() -> f64 { 0.05 }

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "sensors": [
            {"name": "temperature", "base_value": 100, "drift_rate": 0.01, "noise_std": 0.5},
            {"name": "pressure", "base_value": 10}
        ],
        "mqtt": {"broker": "test.mosquitto.org", "port": 1883, "topic": "test/scada"},
        "email": {
            "sender_email": "test@example.com",
            "receiver_email": "ops@example.com",
            "smtp_server": "smtp.example.com",
            "smtp_port": 465,
            "sender_password": "testpassword"
        },
        "failure_conditions": [
            {"name": "Overheat", "conditions": {"temperature": {"above": 120}}, "alert_message": "hot"},
            {"name": "Drift", "drift_conditions": {
                "temperature": {"window_size": 10, "deviation_factor": 1.5, "rate_of_change": 5.0}
            }}
        ]
    }"#;

    fn parse(json: &str) -> RawConfig {
        RawConfig::parse(json, false).unwrap()
    }

    fn problems(result: Result<Config, ConfigError>) -> Vec<String> {
        match result {
            Err(ConfigError::Invalid(problems)) => problems,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn valid_config_round_trips_into_typed_values() {
        let config = Config::from_raw(parse(VALID)).unwrap();

        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[0].base_value, Some(100.0));
        assert_eq!(config.mqtt.broker, "test.mosquitto.org");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.username, None);
        assert_eq!(config.email.as_ref().map(|e| e.smtp_port), Some(465));
        assert_eq!(
            config.drift_conditions.get("temperature"),
            Some(&DriftCondition { window_size: 10, deviation_factor: 1.5, rate_of_change: 5.0 })
        );
        assert_eq!(config.monitor, MonitorConfig::default());
        assert_eq!(config.monitor.storage_policy().max_attempts, 3);
    }

    #[test]
    fn missing_mqtt_fields_fail_closed() {
        let mut raw = parse(VALID);
        raw.mqtt = Some(RawMqtt::default());

        let problems = problems(Config::from_raw(raw));
        assert_eq!(
            problems,
            vec![
                "Missing 'broker' in MQTT configuration",
                "Missing 'port' in MQTT configuration",
                "Missing 'topic' in MQTT configuration",
            ]
        );
    }

    #[test]
    fn all_problems_are_reported_together() {
        let raw = parse(r#"{"sensors": [{"base_value": 1}], "email": {"sender_email": "a@b.c"}}"#);

        let problems = problems(Config::from_raw(raw));
        assert!(problems.contains(&"Sensor at index 0 is missing 'name'".to_string()));
        assert!(problems.contains(&"Missing 'mqtt' section in configuration".to_string()));
        assert!(problems.contains(&"Missing 'smtp_server' in email configuration".to_string()));
        assert_eq!(problems.len(), 5);
    }

    #[test]
    fn missing_sensors_is_fatal() {
        let mut raw = parse(VALID);
        raw.sensors = None;
        let problems = problems(Config::from_raw(raw));
        assert_eq!(problems, vec!["Missing 'sensors' section in configuration"]);
    }

    #[test]
    fn absent_email_disables_notification() {
        let mut raw = parse(VALID);
        raw.email = None;
        let config = Config::from_raw(raw).unwrap();
        assert!(config.email.is_none());
    }

    #[test]
    fn drift_conditions_are_merged_across_entries() {
        let raw = parse(
            r#"{
            "sensors": [{"name": "a"}],
            "mqtt": {"broker": "b", "port": 1, "topic": "t"},
            "failure_conditions": [
                {"drift_conditions": {"a": {"window_size": 3, "deviation_factor": 1.0, "rate_of_change": 1.0}}},
                {"name": "thresholds"},
                {"drift_conditions": {
                    "a": {"window_size": 5, "deviation_factor": 2.0, "rate_of_change": 2.0},
                    "b": {"window_size": 2, "deviation_factor": 1.0, "rate_of_change": 0.5}
                }}
            ]
        }"#,
        );
        let config = Config::from_raw(raw).unwrap();

        assert_eq!(config.drift_conditions.len(), 2);
        assert_eq!(config.drift_conditions["a"].window_size, 5);
        assert_eq!(config.drift_conditions["b"].rate_of_change, 0.5);
        assert_eq!(
            config.warnings,
            vec!["Drift condition for 'a' redefined by entry '<unnamed>', later entry wins".to_string()]
        );
    }

    #[test]
    fn bad_drift_parameters_are_rejected() {
        let raw = parse(
            r#"{
            "sensors": [{"name": "a"}],
            "mqtt": {"broker": "b", "port": 1, "topic": "t"},
            "failure_conditions": [
                {"drift_conditions": {"a": {"window_size": 0, "deviation_factor": -1.0, "rate_of_change": -2.0}}}
            ]
        }"#,
        );
        assert_eq!(problems(Config::from_raw(raw)).len(), 3);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut raw = parse(VALID);
        let env: HashMap<&str, &str> = [
            ("MQTT_BROKER", "env.mosquitto.org"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USERNAME", "scada"),
            ("SMTP_PASSWORD", "env_password"),
        ]
        .into_iter()
        .collect();

        raw.apply_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        let config = Config::from_raw(raw).unwrap();

        assert_eq!(config.mqtt.broker, "env.mosquitto.org");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("scada"));
        assert_eq!(config.email.unwrap().sender_password.as_deref(), Some("env_password"));
    }

    #[test]
    fn smtp_overrides_do_not_create_email_block() {
        let mut raw = parse(VALID);
        raw.email = None;
        raw.apply_env_overrides(|k| (k == "SMTP_SERVER").then(|| "smtp.example.com".to_string()))
            .unwrap();
        assert!(raw.email.is_none());
    }

    #[test]
    fn unparseable_port_override_is_an_error() {
        let mut raw = parse(VALID);
        let err = raw
            .apply_env_overrides(|k| (k == "MQTT_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MQTT_PORT"));
    }

    #[test]
    fn toml_config_is_accepted() {
        let raw = RawConfig::parse(
            r#"
            [[sensors]]
            name = "flow_rate"
            base_value = 50.0

            [mqtt]
            broker = "localhost"
            port = 1883
            topic = "scada/sensors"

            [[failure_conditions]]
            [failure_conditions.drift_conditions.flow_rate]
            window_size = 4
            deviation_factor = 1.2
            rate_of_change = 3.0

            [monitor]
            storage_retries = 5
            "#,
            true,
        )
        .unwrap();
        let config = Config::from_raw(raw).unwrap();

        assert_eq!(config.sensors[0].name, "flow_rate");
        assert_eq!(config.drift_conditions["flow_rate"].window_size, 4);
        assert_eq!(config.monitor.storage_retries, 5);
        assert_eq!(config.monitor.connect_retries, 5);
    }

    #[test]
    fn non_finite_simulation_parameters_are_rejected() {
        let raw = RawConfig::parse(
            r#"
            [[sensors]]
            name = "temperature"
            base_value = inf

            [mqtt]
            broker = "localhost"
            port = 1883
            topic = "scada/sensors"

            [publisher]
            variation = inf
            "#,
            true,
        )
        .unwrap();
        let found = problems(Config::from_raw(raw));
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|p| p.contains("publisher.variation")));
        assert!(found.iter().any(|p| p.contains("non-finite base_value")));

        let raw = parse(
            r#"{
            "sensors": [{"name": "a", "base_value": 1.0}],
            "mqtt": {"broker": "b", "port": 1, "topic": "t"},
            "publisher": {"variation": -0.1}
        }"#,
        );
        assert_eq!(problems(Config::from_raw(raw)).len(), 1);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load("/nonexistent/scada/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
