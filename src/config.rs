use anyhow::{ensure, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://nmea.db";

fn overrides_path() -> Option<PathBuf> {
    env::var("RECORDER_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Optional JSON file whose values apply where the matching env var is unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    bucket_period_ms: Option<u64>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    http_bind: Option<String>,
}

fn load_overrides() -> Option<ConfigOverrides> {
    let path = overrides_path()?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "nmea-recorder failed to read config overrides; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "nmea-recorder failed to parse config overrides; using env defaults"
            );
            None
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides, env_is_set: impl Fn(&str) -> bool) {
    if !env_is_set("RECORDER_DATABASE_URL") && !env_is_set("DATABASE_URL") {
        if let Some(url) = non_empty(overrides.database_url.as_deref()) {
            config.database_url = url;
        }
    }
    if !env_is_set("RECORDER_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if !env_is_set("RECORDER_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if !env_is_set("RECORDER_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if !env_is_set("RECORDER_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if !env_is_set("RECORDER_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = non_empty(overrides.mqtt_topic_prefix.as_deref()) {
            config.mqtt_topic_prefix = prefix;
        }
    }
    if !env_is_set("RECORDER_BUCKET_PERIOD_MS") {
        if let Some(value) = overrides.bucket_period_ms.filter(|v| *v != 0) {
            config.bucket_period_ms = value;
        }
    }
    if !env_is_set("RECORDER_FLUSH_INTERVAL_MS") {
        if let Some(value) = overrides.flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if !env_is_set("RECORDER_HTTP_BIND") {
        if let Some(bind) = non_empty(overrides.http_bind.as_deref()) {
            config.http_bind = bind;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub bucket_period_ms: u64,
    pub flush_interval_ms: u64,
    pub store_timeout_ms: u64,
    pub max_retained_buckets: usize,
    pub http_bind: String,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_pool_size: 5,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_prefix: "nmea".to_string(),
            mqtt_keepalive_secs: 30,
            mqtt_client_id: format!("nmea-recorder-{}", std::process::id()),
            enable_mqtt_listener: true,
            bucket_period_ms: 60_000,
            flush_interval_ms: 10_000,
            store_timeout_ms: 5_000,
            max_retained_buckets: 100_000,
            http_bind: "0.0.0.0:3000".to_string(),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Config::default();
        let database_url = env::var("RECORDER_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .and_then(|value| non_empty(Some(&value)))
            .unwrap_or(defaults.database_url);

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("RECORDER_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size),
            mqtt_host: env::var("RECORDER_MQTT_HOST").unwrap_or(defaults.mqtt_host),
            mqtt_port: env_parse("RECORDER_MQTT_PORT").unwrap_or(defaults.mqtt_port),
            mqtt_username: env::var("RECORDER_MQTT_USERNAME").ok(),
            mqtt_password: env::var("RECORDER_MQTT_PASSWORD").ok(),
            mqtt_topic_prefix: env::var("RECORDER_MQTT_TOPIC_PREFIX")
                .unwrap_or(defaults.mqtt_topic_prefix),
            mqtt_keepalive_secs: env_parse("RECORDER_MQTT_KEEPALIVE_SECS")
                .unwrap_or(defaults.mqtt_keepalive_secs),
            mqtt_client_id: env::var("RECORDER_MQTT_CLIENT_ID")
                .unwrap_or(defaults.mqtt_client_id),
            enable_mqtt_listener: env::var("RECORDER_ENABLE_MQTT")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.enable_mqtt_listener),
            bucket_period_ms: env_parse("RECORDER_BUCKET_PERIOD_MS")
                .unwrap_or(defaults.bucket_period_ms),
            flush_interval_ms: env_parse("RECORDER_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval_ms),
            store_timeout_ms: env_parse("RECORDER_STORE_TIMEOUT_MS")
                .unwrap_or(defaults.store_timeout_ms),
            max_retained_buckets: env_parse("RECORDER_MAX_RETAINED_BUCKETS")
                .unwrap_or(defaults.max_retained_buckets),
            http_bind: env::var("RECORDER_HTTP_BIND").unwrap_or(defaults.http_bind),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        };

        if let Some(overrides) = load_overrides() {
            apply_overrides(&mut config, &overrides, env_is_set);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.bucket_period_ms > 0, "bucket_period_ms must be positive");
        ensure!(self.flush_interval_ms > 0, "flush_interval_ms must be positive");
        ensure!(self.store_timeout_ms > 0, "store_timeout_ms must be positive");
        ensure!(
            self.max_retained_buckets > 0,
            "max_retained_buckets must be positive"
        );
        self.http_addr()?;
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http_bind
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid http_bind {:?}: {err}", self.http_bind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert_eq!(config.bucket_period_ms, 60_000);
        assert_eq!(config.mqtt_topic_prefix, "nmea");
    }

    #[test]
    fn zero_periods_are_rejected() {
        let config = Config {
            bucket_period_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            http_bind: "not an address".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply_only_where_env_is_unset() {
        let mut bytes = br#"{
            "database_url": "sqlite:///var/lib/nmea/history.db",
            "mqtt_host": "broker.local",
            "mqtt_port": 8883,
            "mqtt_username": "  ",
            "bucket_period_ms": 30000,
            "flush_interval_ms": 0
        }"#
        .to_vec();
        let overrides: ConfigOverrides = simd_json::serde::from_slice(&mut bytes).unwrap();

        let mut config = Config {
            mqtt_username: Some("from-env".to_string()),
            ..Config::default()
        };
        apply_overrides(&mut config, &overrides, |key| key == "RECORDER_MQTT_HOST");

        assert_eq!(config.database_url, "sqlite:///var/lib/nmea/history.db");
        assert_eq!(config.mqtt_host, "127.0.0.1");
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.mqtt_username, None);
        assert_eq!(config.bucket_period_ms, 30_000);
        assert_eq!(config.flush_interval_ms, 10_000);
    }
}
