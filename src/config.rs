//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Admission (admin token) configuration
    pub admission: AdmissionConfig,
    /// Proxy engine configuration
    pub proxy: ProxyConfig,
    /// Health aggregator configuration
    pub health: HealthConfig,
    /// Backend route table, keyed by service name
    pub routes: HashMap<String, RouteConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to, e.g. `0.0.0.0:8000`
    pub listen_addr: String,
    /// Graceful shutdown drain timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Admission (admin token store) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Path to the durable token store file (SQLite database)
    pub token_store_path: String,
    /// bcrypt work factor for newly-created tokens
    pub bcrypt_cost: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            token_store_path: "./gateway.state".to_string(),
            bcrypt_cost: 12,
        }
    }
}

/// Proxy engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Per-request total deadline
    #[serde(with = "humantime_serde")]
    pub request_deadline: Duration,
    /// Per-attempt connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Maximum attempts for retryable (idempotent) requests
    pub max_retry_attempts: u32,
    /// Base backoff between retry attempts
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,
    /// Backoff cap between retry attempts
    #[serde(with = "humantime_serde")]
    pub retry_backoff_cap: Duration,
    /// Per-backend concurrent upstream connection cap
    pub backend_concurrency_cap: usize,
    /// Per-backend queue limit before fast-failing with 503
    pub backend_queue_limit: usize,
    /// Maximum buffered-mode request body size (bytes); bodies at or under this
    /// size are buffered for retry, larger ones are streamed and never retried
    pub buffer_threshold_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            max_retry_attempts: 3,
            retry_backoff_base: Duration::from_millis(200),
            retry_backoff_cap: Duration::from_secs(2),
            backend_concurrency_cap: 64,
            backend_queue_limit: 128,
            buffer_threshold_bytes: 1_048_576,
        }
    }
}

/// Health aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between background probes of each backend's `/status`-equivalent
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Timeout for a single probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// A single proxied service route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Backend base URL (scheme + host + port)
    pub base_url: String,
    /// Whether requests to this route require a valid admin token
    #[serde(default)]
    pub protected: bool,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.apply_flat_env_overrides();
        config.apply_backend_url_overrides();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Apply the documented flat `GATEWAY_*` environment variables.
    ///
    /// `Env::prefixed("GATEWAY_").split("__")` (above) only maps
    /// double-underscore-delimited vars onto nested struct paths
    /// (`GATEWAY_SERVER__LISTEN_ADDR` -> `server.listen_addr`). The top-level
    /// operator-facing vars are single-underscore and need an explicit mapping.
    fn apply_flat_env_overrides(&mut self) {
        if let Ok(v) = env::var("GATEWAY_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = env::var("GATEWAY_TOKEN_STORE_PATH") {
            self.admission.token_store_path = v;
        }
        if let Ok(v) = env::var("GATEWAY_PROBE_INTERVAL_SECS") {
            match v.parse::<u64>() {
                Ok(secs) => self.health.probe_interval = Duration::from_secs(secs),
                Err(e) => tracing::warn!("GATEWAY_PROBE_INTERVAL_SECS ignored: {e}"),
            }
        }
        if let Ok(v) = env::var("GATEWAY_REQUEST_DEADLINE_SECS") {
            match v.parse::<u64>() {
                Ok(secs) => self.proxy.request_deadline = Duration::from_secs(secs),
                Err(e) => tracing::warn!("GATEWAY_REQUEST_DEADLINE_SECS ignored: {e}"),
            }
        }
        if let Ok(v) = env::var("GATEWAY_BUFFER_THRESHOLD_BYTES") {
            match v.parse::<usize>() {
                Ok(n) => self.proxy.buffer_threshold_bytes = n,
                Err(e) => tracing::warn!("GATEWAY_BUFFER_THRESHOLD_BYTES ignored: {e}"),
            }
        }
    }

    /// Apply `GATEWAY_BACKEND_<NAME>_URL` overrides on top of the routes loaded from YAML.
    fn apply_backend_url_overrides(&mut self) {
        for (name, route) in &mut self.routes {
            let var = format!("GATEWAY_BACKEND_{}_URL", name.to_uppercase());
            if let Ok(url) = env::var(&var) {
                route.base_url = url;
            }
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a human-readable duration string (e.g., "30s", "5m", "100ms")
    /// or a bare integer (treated as seconds).
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrInt {
            String(String),
            Int(u64),
        }

        match StringOrInt::deserialize(deserializer)? {
            StringOrInt::Int(secs) => Ok(Duration::from_secs(secs)),
            StringOrInt::String(s) => {
                if let Some(ms) = s.strip_suffix("ms") {
                    ms.parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(serde::de::Error::custom)
                } else if let Some(secs) = s.strip_suffix('s') {
                    secs.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                } else if let Some(mins) = s.strip_suffix('m') {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                } else {
                    s.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                }
            }
        }
    }
}
