use crate::error::{BridgeError, Result};
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Response cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 500,
            ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Where the port files used for endpoint discovery live
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub directory: PathBuf,
    /// Written by the peer, holds the port it listens on
    pub server_port_file: String,
    /// Written by us, holds the port we are bound to
    pub client_port_file: String,
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            directory: env::temp_dir(),
            server_port_file: "ableton-js-server.port".to_string(),
            client_port_file: "ableton-js-client.port".to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl DiscoveryConfig {
    pub fn server_port_path(&self) -> PathBuf {
        self.directory.join(&self.server_port_file)
    }

    pub fn client_port_path(&self) -> PathBuf {
        self.directory.join(&self.client_port_file)
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: IpAddr,
    pub heartbeat_interval: Duration,
    pub command_timeout: Duration,
    /// Log a warning for commands slower than this
    pub command_warn_threshold: Option<Duration>,
    pub max_concurrency: usize,
    /// Delay between consecutive chunks of one message
    pub chunk_pacing: Duration,
    /// Overrides the chunk size derived from the socket send buffer
    pub max_chunk_size: Option<usize>,
    pub cache: CacheConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            heartbeat_interval: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(2000),
            command_warn_threshold: None,
            max_concurrency: 200,
            chunk_pacing: Duration::from_millis(1),
            max_chunk_size: None,
            cache: CacheConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LIVE_BRIDGE_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Some(host) = read_var("LIVE_BRIDGE_HOST")? {
            config.host = host;
        }
        if let Some(ms) = read_var("LIVE_BRIDGE_HEARTBEAT_MS")? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_var("LIVE_BRIDGE_COMMAND_TIMEOUT_MS")? {
            config.command_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_var("LIVE_BRIDGE_COMMAND_WARN_MS")? {
            config.command_warn_threshold = Some(Duration::from_millis(ms));
        }
        if let Some(limit) = read_var("LIVE_BRIDGE_MAX_CONCURRENCY")? {
            config.max_concurrency = limit;
        }
        if let Some(size) = read_var("LIVE_BRIDGE_MAX_CHUNK_SIZE")? {
            config.max_chunk_size = Some(size);
        }
        if let Some(enabled) = read_var("LIVE_BRIDGE_CACHE")? {
            config.cache.enabled = enabled;
        }
        if let Some(capacity) = read_var("LIVE_BRIDGE_CACHE_CAPACITY")? {
            config.cache.capacity = capacity;
        }
        if let Some(secs) = read_var("LIVE_BRIDGE_CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(dir) = read_var::<PathBuf>("LIVE_BRIDGE_PORT_DIR")? {
            config.discovery.directory = dir;
        }
        if let Some(name) = read_var("LIVE_BRIDGE_SERVER_PORT_FILE")? {
            config.discovery.server_port_file = name;
        }
        if let Some(name) = read_var("LIVE_BRIDGE_CLIENT_PORT_FILE")? {
            config.discovery.client_port_file = name;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(BridgeError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        // Message ids are a single byte; more in flight would collide
        if self.max_concurrency > 255 {
            return Err(BridgeError::Config(format!(
                "max_concurrency {} exceeds the 255 message ids available",
                self.max_concurrency
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(BridgeError::Config(
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(BridgeError::Config(
                "command_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_chunk_size == Some(0) {
            return Err(BridgeError::Config(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(BridgeError::Config(
                "cache capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an optional environment variable
fn read_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| BridgeError::Config(format!("{}={:?}: {}", name, raw, e))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(BridgeError::Config(format!("{}: {}", name, e))),
    }
}
