use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "./relay-setup.json";

pub const DEFAULT_BATCH_SIZE: usize = 30;
pub const DEFAULT_VITALS_TTL_SECS: i64 = 300;

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("RELAY_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    api_endpoint: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    data_source: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    telemetry_topic: Option<String>,
    #[serde(default)]
    max_inflight_dispatches: Option<usize>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
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
                "failed to parse setup config; using env defaults"
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
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("RELAY_DATABASE_URL") {
        if let Some(url) = non_empty(overrides.database_url.as_deref()) {
            config.database_url = url;
        }
    }
    if env_allows("RELAY_API_ENDPOINT") {
        if let Some(endpoint) = non_empty(overrides.api_endpoint.as_deref()) {
            config.api_endpoint = Some(endpoint);
        }
    }
    if env_allows("RELAY_API_KEY") {
        if let Some(key) = non_empty(overrides.api_key.as_deref()) {
            config.api_key = Some(key);
        }
    }
    if env_allows("RELAY_DATA_SOURCE") {
        if let Some(source) = non_empty(overrides.data_source.as_deref()) {
            config.data_source = source;
        }
    }
    if env_allows("RELAY_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("RELAY_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("RELAY_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if env_allows("RELAY_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if env_allows("RELAY_TELEMETRY_TOPIC") {
        if let Some(topic) = non_empty(overrides.telemetry_topic.as_deref()) {
            config.telemetry_topic = topic;
        }
    }
    if env_allows("RELAY_MAX_INFLIGHT_DISPATCHES") {
        if let Some(value) = overrides.max_inflight_dispatches.filter(|v| *v != 0) {
            config.max_inflight_dispatches = value;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub api_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub test_api_endpoint: Option<String>,
    pub test_api_key: Option<String>,
    pub use_test_url: bool,
    pub data_source: String,
    pub write_to_file: bool,
    pub output_dir: PathBuf,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub control_topic_prefix: String,
    pub telemetry_topic: String,
    pub sensor_device_type: String,
    pub batch_size: usize,
    pub vitals_ttl_secs: i64,
    pub housekeeping_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_inflight_dispatches: usize,
    pub otlp_endpoint: Option<String>,
}

/// Endpoint and bearer token the dispatcher posts to, after the test-URL switch.
#[derive(Clone, Debug)]
pub struct ApiTarget {
    pub endpoint: String,
    pub api_key: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url =
            env::var("RELAY_DATABASE_URL").unwrap_or_else(|_| "sqlite://relay.db".to_string());
        let mqtt_client_id = env::var("RELAY_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("biosensor-relay-{}", std::process::id()));

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("RELAY_DB_POOL_SIZE", 4),
            api_endpoint: non_empty(env::var("RELAY_API_ENDPOINT").ok().as_deref()),
            api_key: non_empty(env::var("RELAY_API_KEY").ok().as_deref()),
            test_api_endpoint: non_empty(env::var("RELAY_TEST_API_ENDPOINT").ok().as_deref()),
            test_api_key: non_empty(env::var("RELAY_TEST_API_KEY").ok().as_deref()),
            use_test_url: env_flag("RELAY_USE_TEST_URL"),
            data_source: env::var("RELAY_DATA_SOURCE")
                .unwrap_or_else(|_| "DefaultSource".to_string()),
            write_to_file: env_flag("RELAY_WRITE_TO_FILE"),
            output_dir: PathBuf::from(
                env::var("RELAY_OUTPUT_DIR").unwrap_or_else(|_| "processed_data".to_string()),
            ),
            mqtt_host: env::var("RELAY_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            mqtt_port: env_parse("RELAY_MQTT_PORT", 1883),
            mqtt_username: non_empty(env::var("RELAY_MQTT_USERNAME").ok().as_deref()),
            mqtt_password: non_empty(env::var("RELAY_MQTT_PASSWORD").ok().as_deref()),
            mqtt_client_id,
            mqtt_keepalive_secs: env_parse("RELAY_MQTT_KEEPALIVE_SECS", 30),
            control_topic_prefix: env::var("RELAY_CONTROL_TOPIC_PREFIX")
                .unwrap_or_else(|_| "arrhythmia".to_string()),
            telemetry_topic: env::var("RELAY_TELEMETRY_TOPIC")
                .unwrap_or_else(|_| "patient-vitals-data-topic".to_string()),
            sensor_device_type: env::var("RELAY_SENSOR_DEVICE_TYPE")
                .unwrap_or_else(|_| "BIOSENSOR_NEXUS".to_string()),
            batch_size: env_parse("RELAY_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            vitals_ttl_secs: env_parse("RELAY_VITALS_TTL_SECS", DEFAULT_VITALS_TTL_SECS),
            housekeeping_interval_secs: env_parse("RELAY_HOUSEKEEPING_INTERVAL_SECS", 60).max(1),
            request_timeout_secs: env_parse("RELAY_REQUEST_TIMEOUT_SECS", 15),
            max_inflight_dispatches: env_parse("RELAY_MAX_INFLIGHT_DISPATCHES", 32).max(1),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| !env_is_set(key));
        }

        Ok(config)
    }

    pub fn api_target(&self) -> Result<ApiTarget> {
        let (endpoint, api_key) = if self.use_test_url {
            tracing::info!("using test API endpoint");
            (self.test_api_endpoint.clone(), self.test_api_key.clone())
        } else {
            (self.api_endpoint.clone(), self.api_key.clone())
        };
        let endpoint = endpoint.context(if self.use_test_url {
            "RELAY_TEST_API_ENDPOINT is required when RELAY_USE_TEST_URL is set"
        } else {
            "RELAY_API_ENDPOINT is required"
        })?;
        let api_key = api_key.context(if self.use_test_url {
            "RELAY_TEST_API_KEY is required when RELAY_USE_TEST_URL is set"
        } else {
            "RELAY_API_KEY is required"
        })?;
        Ok(ApiTarget { endpoint, api_key })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn svc_start_topic(&self) -> String {
        format!("{}/svc_start", self.control_topic_prefix)
    }

    pub fn svc_action_topic(&self) -> String {
        format!("{}/svc_action", self.control_topic_prefix)
    }

    pub fn log_summary(&self) {
        let set = |value: &Option<String>| if value.is_some() { "set" } else { "not set" };
        tracing::info!(
            database_url = %self.database_url,
            mqtt = %format!("{}:{}", self.mqtt_host, self.mqtt_port),
            control_prefix = %self.control_topic_prefix,
            telemetry_topic = %self.telemetry_topic,
            api_endpoint = self.api_endpoint.as_deref().unwrap_or("<unset>"),
            api_key = set(&self.api_key),
            mqtt_password = set(&self.mqtt_password),
            use_test_url = self.use_test_url,
            data_source = %self.data_source,
            write_to_file = self.write_to_file,
            batch_size = self.batch_size,
            "service configuration"
        );
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        db_pool_size: 1,
        api_endpoint: Some("http://127.0.0.1:9/data".to_string()),
        api_key: Some("test-key".to_string()),
        test_api_endpoint: None,
        test_api_key: None,
        use_test_url: false,
        data_source: "DefaultSource".to_string(),
        write_to_file: false,
        output_dir: PathBuf::from("processed_data"),
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_client_id: "biosensor-relay-test".to_string(),
        mqtt_keepalive_secs: 30,
        control_topic_prefix: "arrhythmia".to_string(),
        telemetry_topic: "patient-vitals-data-topic".to_string(),
        sensor_device_type: "BIOSENSOR_NEXUS".to_string(),
        batch_size: DEFAULT_BATCH_SIZE,
        vitals_ttl_secs: DEFAULT_VITALS_TTL_SECS,
        housekeeping_interval_secs: 60,
        request_timeout_secs: 15,
        max_inflight_dispatches: 4,
        otlp_endpoint: None,
    }
}
