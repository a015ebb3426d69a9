//! # Environment-Based Configuration
//!
//! Bridge settings come from a builder that can be seeded from environment
//! variables and is validated once in [`BridgeConfigBuilder::build`].
//!
//! ## Environment Variables
//!
//! - `COURIER_BIND_ADDR` - Listen address (default: 0.0.0.0:8080)
//! - `COURIER_CHANNEL` - Pub/sub channel (default: courier.envelopes)
//! - `COURIER_REDIS_URL` - Redis URL; unset means the in-memory bus
//! - `COURIER_REQUEST_TIMEOUT_SECS` - Outbound HTTP timeout for sending and forwarding (default: 30)
//! - `COURIER_MAX_BODY_SIZE` - Maximum inbound body in bytes (default: 1048576 / 1MB)
//! - `COURIER_ENABLE_CORS` - Enable permissive CORS (default: true)
//! - `COURIER_HANDLER_TIMEOUT_MS` - Receive loop handler timeout (default: 30000)
//! - `COURIER_MAX_DETACHED_HANDLERS` - Late handlers kept running before aborting (default: 64)
//! - `COURIER_FORWARD_TARGETS` - Comma-separated `AGENT=URL` forwarding targets

use courier_mesh::{AgentId, Channel, ReceiverConfig};
use std::{env, fmt, net::SocketAddr, ops::RangeInclusive, str::FromStr, time::Duration};
use url::Url;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

const MAX_BODY_LIMIT: usize = 16 * 1024 * 1024;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;

/// A remote agent the bridge forwards envelopes to
///
/// Parsed from `AGENT=URL`, e.g. `Agent2=http://10.0.0.7:9000/messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub agent: AgentId,
    pub endpoint: Url,
}

impl FromStr for ForwardTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, endpoint) = s
            .split_once('=')
            .ok_or_else(|| format!("expected AGENT=URL, got '{s}'"))?;

        let agent = AgentId::parse(agent).map_err(|e| format!("invalid agent '{agent}': {e}"))?;
        let endpoint =
            Url::parse(endpoint).map_err(|e| format!("invalid url '{endpoint}': {e}"))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(format!("url '{endpoint}' must be http or https"));
        }

        Ok(Self { agent, endpoint })
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.agent, self.endpoint)
    }
}

/// Validated bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    pub channel: Channel,
    pub redis_url: Option<String>,
    pub request_timeout_secs: u64,
    pub max_body_size: usize,
    pub enable_cors: bool,
    pub handler_timeout_ms: u64,
    pub max_detached_handlers: usize,
    pub forward_targets: Vec<ForwardTarget>,
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Settings for the bridge's own receive loop
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig::new(self.channel.clone())
            .with_handler_timeout(Duration::from_millis(self.handler_timeout_ms))
            .with_max_detached(self.max_detached_handlers)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfigBuilder::default().into_config()
    }
}

/// Builder for [`BridgeConfig`] with environment variable support
#[derive(Debug, Clone)]
pub struct BridgeConfigBuilder {
    bind_addr: SocketAddr,
    channel: Channel,
    redis_url: Option<String>,
    request_timeout_secs: u64,
    max_body_size: usize,
    enable_cors: bool,
    handler_timeout_ms: u64,
    max_detached_handlers: usize,
    forward_targets: Vec<ForwardTarget>,
}

impl Default for BridgeConfigBuilder {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            channel: Channel::default(),
            redis_url: None,
            request_timeout_secs: 30,
            max_body_size: 1024 * 1024, // 1MB
            enable_cors: true,
            handler_timeout_ms: 30_000,
            max_detached_handlers: 64,
            forward_targets: Vec::new(),
        }
    }
}

impl BridgeConfigBuilder {
    /// Create a new builder with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if any variable cannot be parsed.
    /// Range checks happen in [`build`](Self::build).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::default();

        if let Some(addr) = get_env_parsed::<SocketAddr>("COURIER_BIND_ADDR")? {
            builder = builder.bind_addr(addr);
        }
        if let Some(channel) = get_env_string("COURIER_CHANNEL") {
            let channel = Channel::parse(&channel).map_err(|e| ConfigError::InvalidEnvVar {
                key: "COURIER_CHANNEL".to_string(),
                message: format!("invalid channel '{channel}': {e}"),
            })?;
            builder = builder.channel(channel);
        }
        if let Some(url) = get_env_string("COURIER_REDIS_URL").filter(|u| !u.is_empty()) {
            builder = builder.redis_url(url);
        }
        if let Some(timeout) = get_env_parsed::<u64>("COURIER_REQUEST_TIMEOUT_SECS")? {
            builder = builder.request_timeout_secs(timeout);
        }
        if let Some(max_size) = get_env_parsed::<usize>("COURIER_MAX_BODY_SIZE")? {
            builder = builder.max_body_size(max_size);
        }
        if let Some(cors) = get_env_bool("COURIER_ENABLE_CORS")? {
            builder = builder.enable_cors(cors);
        }
        if let Some(timeout) = get_env_parsed::<u64>("COURIER_HANDLER_TIMEOUT_MS")? {
            builder = builder.handler_timeout_ms(timeout);
        }
        if let Some(max) = get_env_parsed::<usize>("COURIER_MAX_DETACHED_HANDLERS")? {
            builder = builder.max_detached_handlers(max);
        }
        if let Some(targets) = get_env_string("COURIER_FORWARD_TARGETS") {
            for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let target = target
                    .parse::<ForwardTarget>()
                    .map_err(|message| ConfigError::InvalidEnvVar {
                        key: "COURIER_FORWARD_TARGETS".to_string(),
                        message,
                    })?;
                builder = builder.forward_target(target);
            }
        }

        Ok(builder)
    }

    /// Set the listen address
    #[must_use]
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the pub/sub channel
    #[must_use]
    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Use Redis at `url` instead of the in-memory bus
    #[must_use]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set request timeout in seconds
    #[must_use]
    pub fn request_timeout_secs(mut self, timeout: u64) -> Self {
        self.request_timeout_secs = timeout;
        self
    }

    /// Set maximum request body size in bytes
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Enable or disable CORS
    #[must_use]
    pub fn enable_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    /// Set the receive loop handler timeout in milliseconds
    #[must_use]
    pub fn handler_timeout_ms(mut self, timeout: u64) -> Self {
        self.handler_timeout_ms = timeout;
        self
    }

    #[must_use]
    pub fn max_detached_handlers(mut self, max: usize) -> Self {
        self.max_detached_handlers = max;
        self
    }

    /// Add a forwarding target
    #[must_use]
    pub fn forward_target(mut self, target: ForwardTarget) -> Self {
        self.forward_targets.push(target);
        self
    }

    /// Validate configuration and build [`BridgeConfig`]
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        self.validate()?;
        Ok(self.into_config())
    }

    fn into_config(self) -> BridgeConfig {
        BridgeConfig {
            bind_addr: self.bind_addr,
            channel: self.channel,
            redis_url: self.redis_url,
            request_timeout_secs: self.request_timeout_secs,
            max_body_size: self.max_body_size,
            enable_cors: self.enable_cors,
            handler_timeout_ms: self.handler_timeout_ms,
            max_detached_handlers: self.max_detached_handlers,
            forward_targets: self.forward_targets,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "request_timeout_secs",
            self.request_timeout_secs,
            1..=MAX_REQUEST_TIMEOUT_SECS,
        )?;
        check_range("max_body_size", self.max_body_size, 1..=MAX_BODY_LIMIT)?;
        check_range("handler_timeout_ms", self.handler_timeout_ms, 1..=u64::MAX)?;

        if let Some(url) = &self.redis_url
            && !url.starts_with("redis://")
            && !url.starts_with("rediss://")
        {
            return Err(ConfigError::ValidationError(format!(
                "redis_url must start with redis:// or rediss://, got '{url}'"
            )));
        }

        Ok(())
    }
}

fn check_range<T>(name: &str, value: T, range: RangeInclusive<T>) -> Result<(), ConfigError>
where
    T: PartialOrd + fmt::Display,
{
    if range.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::ValidationError(format!(
        "{name} must be between {} and {}, got {value}",
        range.start(),
        range.end()
    )))
}

// Environment variable helper functions

fn get_env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        Err(_) => Ok(None),
    }
}

fn get_env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}
