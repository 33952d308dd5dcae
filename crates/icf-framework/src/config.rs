//! Framework configuration
//!
//! Settings for the connector server, the remote request distributor, the
//! facade cache, batch retention and logging. Every section has defaults,
//! can be read from a JSON document, and can be overridden from `ICF_*`
//! environment variables.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use icf_rpc::GroupConfig;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(var: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        message: message.into(),
    }
}

/// Read an optional environment variable, failing on values that do not
/// parse.
fn env_parse<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(var, format!("{e}"))),
        _ => Ok(None),
    }
}

// ============================================================================
// Server
// ============================================================================

/// Connector server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Serve over TLS. Recognised but not implemented; the server logs a
    /// warning and serves plain TCP.
    #[serde(default)]
    pub use_ssl: bool,

    /// Directory connector bundles are installed in.
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: PathBuf,

    /// Base64 SHA-256 hash of the shared key clients must present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hash: Option<String>,
}

fn default_port() -> u16 {
    8759
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_bundle_dir() -> PathBuf {
    PathBuf::from("bundles")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            use_ssl: false,
            bundle_dir: default_bundle_dir(),
            key_hash: None,
        }
    }
}

impl ServerConfig {
    /// Hash a shared key the way it is stored.
    pub fn hash_key(key: &str) -> String {
        STANDARD.encode(Sha256::digest(key.as_bytes()))
    }

    /// Store the hash of a new shared key.
    pub fn set_key(&mut self, key: &str) {
        self.key_hash = Some(Self::hash_key(key));
    }

    /// Set the shared key.
    #[must_use]
    pub fn with_key(mut self, key: &str) -> Self {
        self.set_key(key);
        self
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the bind address.
    #[must_use]
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Check a key presented by a client.
    ///
    /// Without a stored hash every key is refused.
    pub fn verify_key(&self, key: &str) -> bool {
        self.key_hash
            .as_deref()
            .is_some_and(|stored| stored == Self::hash_key(key))
    }

    /// Socket address to listen on.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

// ============================================================================
// Distributor
// ============================================================================

/// Settings of the remote request distributor, shared by client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// How long a remote call waits for its answer (milliseconds).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Incoming requests executed at once per connection group.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Keep a group usable after its last connection drops.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,

    /// Interval of liveness checks and maintenance (milliseconds).
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    300_000
}

fn default_max_concurrent_requests() -> usize {
    64
}

fn default_reconnect() -> bool {
    true
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            reconnect: default_reconnect(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl DistributorConfig {
    /// Set the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set reconnect support.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Settings for one connection group.
    pub fn group_config(&self) -> GroupConfig {
        GroupConfig::default()
            .with_reconnect(self.reconnect)
            .with_max_concurrent_requests(self.max_concurrent_requests)
    }
}

// ============================================================================
// Facade cache
// ============================================================================

/// Facade cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Facades unused this long are disposed (seconds).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between eviction sweeps (seconds).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Retention of uncollected asynchronous batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// A finished batch nobody collected is dropped after this long (seconds).
    #[serde(default = "default_retention_finished_secs")]
    pub retention_finished_secs: u64,

    /// A running batch without activity is cancelled after this long (seconds).
    #[serde(default = "default_retention_running_secs")]
    pub retention_running_secs: u64,
}

fn default_retention_finished_secs() -> u64 {
    10 * 60
}

fn default_retention_running_secs() -> u64 {
    60 * 60
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            retention_finished_secs: default_retention_finished_secs(),
            retention_running_secs: default_retention_running_secs(),
        }
    }
}

impl BatchConfig {
    /// Set both retention periods.
    #[must_use]
    pub fn with_retention(mut self, finished: Duration, running: Duration) -> Self {
        self.retention_finished_secs = finished.as_secs();
        self.retention_running_secs = running.as_secs();
        self
    }

    pub fn retention_finished(&self) -> Duration {
        Duration::from_secs(self.retention_finished_secs)
    }

    pub fn retention_running(&self) -> Duration {
        Duration::from_secs(self.retention_running_secs)
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info,icf_rpc=info,icf_framework=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

// ============================================================================
// Framework
// ============================================================================

/// Complete framework configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub distributor: DistributorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FrameworkConfig {
    /// Parse a JSON document; missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Defaults overridden by environment variables.
    ///
    /// # Variables
    ///
    /// - `ICF_SERVER_PORT`, `ICF_SERVER_BIND_ADDRESS`, `ICF_SERVER_USE_SSL`
    /// - `ICF_SERVER_BUNDLE_DIR`, `ICF_SERVER_KEY_HASH`
    /// - `ICF_REQUEST_TIMEOUT_MS`, `ICF_MAX_CONCURRENT_REQUESTS`, `ICF_HEARTBEAT_MS`
    /// - `ICF_CACHE_IDLE_TIMEOUT_SECS`, `ICF_CACHE_SWEEP_INTERVAL_SECS`
    /// - `ICF_BATCH_RETENTION_FINISHED_SECS`, `ICF_BATCH_RETENTION_RUNNING_SECS`
    /// - `ICF_LOG_FILTER`, `ICF_LOG_JSON`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override settings from `ICF_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = env_parse("ICF_SERVER_PORT")? {
            self.server.port = port;
        }
        if let Some(address) = env_parse("ICF_SERVER_BIND_ADDRESS")? {
            self.server.bind_address = address;
        }
        if let Some(use_ssl) = env_parse("ICF_SERVER_USE_SSL")? {
            self.server.use_ssl = use_ssl;
        }
        if let Ok(dir) = env::var("ICF_SERVER_BUNDLE_DIR") {
            self.server.bundle_dir = PathBuf::from(dir);
        }
        if let Ok(hash) = env::var("ICF_SERVER_KEY_HASH") {
            self.server.key_hash = Some(hash);
        }
        if let Some(timeout) = env_parse("ICF_REQUEST_TIMEOUT_MS")? {
            self.distributor.request_timeout_ms = timeout;
        }
        if let Some(max) = env_parse("ICF_MAX_CONCURRENT_REQUESTS")? {
            self.distributor.max_concurrent_requests = max;
        }
        if let Some(heartbeat) = env_parse("ICF_HEARTBEAT_MS")? {
            self.distributor.heartbeat_ms = heartbeat;
        }
        if let Some(idle) = env_parse("ICF_CACHE_IDLE_TIMEOUT_SECS")? {
            self.cache.idle_timeout_secs = idle;
        }
        if let Some(interval) = env_parse("ICF_CACHE_SWEEP_INTERVAL_SECS")? {
            self.cache.sweep_interval_secs = interval;
        }
        if let Some(finished) = env_parse("ICF_BATCH_RETENTION_FINISHED_SECS")? {
            self.batch.retention_finished_secs = finished;
        }
        if let Some(running) = env_parse("ICF_BATCH_RETENTION_RUNNING_SECS")? {
            self.batch.retention_running_secs = running;
        }
        if let Ok(filter) = env::var("ICF_LOG_FILTER") {
            self.logging.filter = filter;
        }
        if let Some(json) = env_parse("ICF_LOG_JSON")? {
            self.logging.json = json;
        }
        Ok(())
    }

    /// Reject settings the framework cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.distributor.request_timeout_ms == 0 {
            return Err(invalid("distributor.request_timeout_ms", "must be positive"));
        }
        if self.distributor.max_concurrent_requests == 0 {
            return Err(invalid(
                "distributor.max_concurrent_requests",
                "must be positive",
            ));
        }
        if self.distributor.heartbeat_ms == 0 {
            return Err(invalid("distributor.heartbeat_ms", "must be positive"));
        }
        if let Some(hash) = &self.server.key_hash {
            let decoded = STANDARD
                .decode(hash)
                .map_err(|e| invalid("server.key_hash", format!("not base64: {e}")))?;
            if decoded.len() != 32 {
                return Err(invalid("server.key_hash", "not a SHA-256 digest"));
            }
        }
        Ok(())
    }
}
