use config::{self, File};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Environment variable prefix for connection settings
pub const ENV_PREFIX: &str = "FLUSHLINE";

/// Collector port used for TCP when none is configured
pub const DEFAULT_TCP_PORT: u16 = 9428;

/// Collector port used for UDP when none is configured
pub const DEFAULT_UDP_PORT: u16 = 9429;

/// Transport protocol spoken with the collector
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Length-prefixed frames over a TCP stream
    #[default]
    #[serde(alias = "TCP", alias = "Tcp")]
    Tcp,
    /// One datagram per batch
    #[serde(alias = "UDP", alias = "Udp")]
    Udp,
}

impl Protocol {
    /// Port used when the configuration does not name one
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Tcp => DEFAULT_TCP_PORT,
            Protocol::Udp => DEFAULT_UDP_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            other => Err(AgentError::Config(format!("Unknown protocol: {}", other))),
        }
    }
}

/// Logging level
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Collector discovery settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// Whether to probe for a collector at all
    #[serde(default = "default_discovery_enabled")]
    pub enabled: bool,
    /// Multicast group the probe is sent to
    #[serde(default = "default_discovery_network")]
    pub network: String,
    /// Port the probe is sent to
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// How long to wait for a response in milliseconds
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Protocol requested from responders
    #[serde(default)]
    pub preferred_protocol: Protocol,
    /// Interface (address or host name) the response socket binds to
    #[serde(default = "default_listen_interface")]
    pub listen_interface: String,
}

impl DiscoveryConfig {
    /// Discovery timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_discovery_enabled(),
            network: default_discovery_network(),
            port: default_discovery_port(),
            timeout_ms: default_discovery_timeout_ms(),
            preferred_protocol: Protocol::default(),
            listen_interface: default_listen_interface(),
        }
    }
}

/// Collector endpoint and flush configuration, read once at startup
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Collector host; absent (or empty) means discovery must find one
    #[serde(default = "default_host", deserialize_with = "non_empty_host")]
    pub host: Option<String>,
    /// Collector port; defaults by protocol
    #[serde(default)]
    pub port: Option<u16>,
    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Pending samples that force a flush
    #[serde(default = "default_max_flush_size")]
    pub max_flush_size: usize,
    /// Maximum time between flushes in milliseconds
    #[serde(default = "default_max_flush_time_ms")]
    pub max_flush_time_ms: u64,
    /// Connect timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Timeout for synchronous sends in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub synch_op_timeout_ms: u64,
    /// Maximum snapshots held awaiting transmission
    #[serde(default)]
    pub buffer_capacity: Option<usize>,
    /// Discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Logging level
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_host() -> Option<String> {
    Some("localhost".to_string())
}

fn non_empty_host<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let host = Option::<String>::deserialize(deserializer)?;
    Ok(host.filter(|h| !h.trim().is_empty()))
}

fn default_max_flush_size() -> usize {
    200
}

fn default_max_flush_time_ms() -> u64 {
    5000
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_discovery_enabled() -> bool {
    true
}

fn default_discovery_network() -> String {
    "224.9.3.7".to_string()
}

fn default_discovery_port() -> u16 {
    1836
}

fn default_discovery_timeout_ms() -> u64 {
    3000
}

/// Local host name, or the wildcard address when it cannot be read
fn default_listen_interface() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Unable to read local host name, listening on all interfaces: {}", e);
            Ipv4Addr::UNSPECIFIED.to_string()
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            protocol: Protocol::default(),
            max_flush_size: default_max_flush_size(),
            max_flush_time_ms: default_max_flush_time_ms(),
            connect_timeout_ms: default_timeout_ms(),
            synch_op_timeout_ms: default_timeout_ms(),
            buffer_capacity: None,
            discovery: DiscoveryConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl EndpointConfig {
    /// Load from the given sources, later sources overriding earlier ones
    pub fn load(sources: Vec<ConfigSource>) -> Result<Self> {
        let config: Self = load_config(sources)?;
        config.validate()?;
        Ok(config)
    }

    /// Port to connect to, falling back to the protocol default
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Bound of the trace buffer
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
            .unwrap_or_else(|| self.max_flush_size.saturating_mul(10))
    }

    pub fn max_flush_time(&self) -> Duration {
        Duration::from_millis(self.max_flush_time_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn synch_op_timeout(&self) -> Duration {
        Duration::from_millis(self.synch_op_timeout_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_flush_size == 0 {
            return Err(AgentError::Config("max_flush_size must be positive".to_string()));
        }
        if self.max_flush_time_ms == 0 {
            return Err(AgentError::Config("max_flush_time_ms must be positive".to_string()));
        }
        if self.connect_timeout_ms == 0 || self.synch_op_timeout_ms == 0 {
            return Err(AgentError::Config("timeouts must be positive".to_string()));
        }
        if self.buffer_capacity() == 0 {
            return Err(AgentError::Config("buffer_capacity must be positive".to_string()));
        }
        if self.discovery.enabled {
            self.discovery
                .network
                .parse::<Ipv4Addr>()
                .map_err(|e| {
                    AgentError::Config(format!(
                        "Invalid discovery network '{}': {}",
                        self.discovery.network, e
                    ))
                })?;
            if self.discovery.timeout_ms == 0 {
                return Err(AgentError::Config("discovery.timeout_ms must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path, format taken from the extension
    File(PathBuf),
    /// Process environment variables with a prefix
    Environment(String),
    /// Explicit variable map read as if it were the environment
    EnvironmentMap(String, HashMap<String, String>),
    /// TOML string
    Toml(String),
    /// Process-local settings; these always win
    Settings(HashMap<String, String>),
}

fn file_format(path: &Path) -> Result<config::FileFormat> {
    let extension = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_lowercase(),
        None => {
            return Err(AgentError::Config(format!(
                "Configuration file has no extension: {}",
                path.display()
            )));
        }
    };

    match extension.as_str() {
        "toml" => Ok(config::FileFormat::Toml),
        "json" => Ok(config::FileFormat::Json),
        "yaml" | "yml" => Ok(config::FileFormat::Yaml),
        format => Err(AgentError::Config(format!("Unsupported config format: {}", format))),
    }
}

fn environment(prefix: &str) -> config::Environment {
    config::Environment::with_prefix(prefix)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn build(sources: Vec<ConfigSource>) -> Result<config::Config> {
    let mut builder = config::Config::builder();
    let mut overrides = Vec::new();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                if !path.exists() {
                    warn!("Configuration file not found: {}", path.display());
                    continue;
                }
                let format = file_format(&path)?;
                debug!("Loading configuration from file: {}", path.display());
                builder = builder.add_source(File::from(path).format(format));
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(environment(&prefix));
            }
            ConfigSource::EnvironmentMap(prefix, vars) => {
                debug!("Loading configuration from {} supplied variables", vars.len());
                builder = builder
                    .add_source(environment(&prefix).source(Some(vars.into_iter().collect())));
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder.add_source(File::from_str(&toml_str, config::FileFormat::Toml));
            }
            ConfigSource::Settings(settings) => overrides.extend(settings),
        }
    }

    for (key, value) in overrides {
        builder = builder.set_override(key, value)?;
    }

    builder
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to build configuration: {}", e)))
}

/// Load configuration of any deserializable shape from various sources
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: DeserializeOwned + fmt::Debug,
{
    let result = build(sources)?
        .try_deserialize()
        .map_err(|e| AgentError::Config(format!("Failed to deserialize configuration: {}", e)))?;

    debug!("Configuration loaded successfully: {:?}", result);

    Ok(result)
}

/// Configuration builder
pub struct ConfigBuilder {
    sources: Vec<ConfigSource>,
}

impl ConfigBuilder {
    /// Create a new config builder
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    /// Add a configuration file
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sources.push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add the process environment
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Environment(prefix.into()));
        self
    }

    /// Add a TOML string
    pub fn add_toml(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Toml(toml.into()));
        self
    }

    /// Add one process-local setting
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut settings = HashMap::new();
        settings.insert(key.into(), value.into());
        self.sources.push(ConfigSource::Settings(settings));
        self
    }

    /// Add a source
    pub fn add_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Build the endpoint configuration
    pub fn build(self) -> Result<EndpointConfig> {
        EndpointConfig::load(self.sources)
    }

    /// Build a typed accessor over the raw keys
    pub fn settings(self) -> Result<Settings> {
        Ok(Settings { inner: build(self.sources)? })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed key lookup with defaults
pub struct Settings {
    inner: config::Config,
}

impl Settings {
    /// Read `key`, or `default` when it is missing or of the wrong type
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.inner.get::<T>(key) {
            Ok(value) => value,
            Err(config::ConfigError::NotFound(_)) => default,
            Err(e) => {
                warn!("Ignoring setting '{}': {}", key, e);
                default
            }
        }
    }

    /// Read `key` if present
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.inner.get::<T>(key) {
            Ok(value) => Ok(Some(value)),
            Err(config::ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
