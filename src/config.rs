//! Configuration file and command-line overrides.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::error::ConfigError;
use crate::integrations::platform::DEFAULT_RESOLV_CONF;
use crate::upstream::{
    DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD, DEFAULT_FALLBACKS, DEFAULT_LATENCY_SMOOTHING,
    RegistryConfig,
};

/// Port upstream resolvers listen on when none is given.
pub const DNS_PORT: u16 = 53;

const LOCAL_CONFIG: &str = "sidestep.toml";
const SYSTEM_CONFIG: &str = "/etc/sidestep/config.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    pub blocking: BlockingConfig,
    pub content_safety: ContentSafetyConfig,
    pub logging: LoggingConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Queries handled concurrently before the receive loop waits.
    pub max_in_flight: usize,
    pub stats_interval_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DNS_PORT,
            max_in_flight: 256,
            stats_interval_secs: 60,
            purge_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl_secs: DEFAULT_TTL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Overrides the primary detected from the host configuration.
    pub primary: Option<String>,
    pub fallbacks: Vec<String>,
    pub timeout_ms: u64,
    pub max_attempts: usize,
    /// Wall-clock limit for all attempts of one query.
    pub budget_ms: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub latency_smoothing: f64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            primary: None,
            fallbacks: DEFAULT_FALLBACKS.iter().map(ToString::to_string).collect(),
            timeout_ms: 3000,
            max_attempts: 4,
            budget_ms: 8000,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN.as_secs(),
            latency_smoothing: DEFAULT_LATENCY_SMOOTHING,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BlockingConfig {
    /// Extra blocklist file, one address or CIDR network per line.
    pub file: Option<PathBuf>,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContentSafetyConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_in_flight: usize,
}

impl Default for ContentSafetyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 10,
            max_in_flight: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Log one line per answered query.
    pub queries: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            queries: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Point the host resolver at the proxy while it runs.
    pub manage_resolver: bool,
    pub resolv_conf: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            manage_resolver: false,
            resolv_conf: PathBuf::from(DEFAULT_RESOLV_CONF),
        }
    }
}

/// Command-line overrides for configuration
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind_address: Option<String>,
    pub primary: Option<String>,
    pub log_level: Option<String>,
    pub manage_resolver: bool,
}

impl Config {
    /// Load configuration from file or use defaults
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. sidestep.toml in current directory
    /// 3. /etc/sidestep/config.toml
    /// 4. Default configuration
    pub fn load(path: Option<&Path>, overrides: CliOverrides) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if Path::new(LOCAL_CONFIG).exists() {
            Self::from_file(Path::new(LOCAL_CONFIG))?
        } else if Path::new(SYSTEM_CONFIG).exists() {
            Self::from_file(Path::new(SYSTEM_CONFIG))?
        } else {
            Self::default()
        };

        config.apply_cli_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    fn apply_cli_overrides(&mut self, overrides: CliOverrides) {
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(bind) = overrides.bind_address {
            self.server.bind_address = bind;
        }
        if let Some(primary) = overrides.primary {
            self.upstream.primary = Some(primary);
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if overrides.manage_resolver {
            self.system.manage_resolver = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        self.listen_addr()?;
        if self.server.max_in_flight == 0 {
            return invalid("server.max_in_flight must be at least 1");
        }
        if self.server.stats_interval_secs == 0 || self.server.purge_interval_secs == 0 {
            return invalid("server intervals must be non-zero");
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity must be at least 1");
        }
        if self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs must be at least 1");
        }
        if self.upstream.timeout_ms == 0 || self.upstream.budget_ms == 0 {
            return invalid("upstream timeouts must be non-zero");
        }
        if self.upstream.max_attempts == 0 {
            return invalid("upstream.max_attempts must be at least 1");
        }
        if self.upstream.failure_threshold == 0 {
            return invalid("upstream.failure_threshold must be at least 1");
        }
        let alpha = self.upstream.latency_smoothing;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return invalid("upstream.latency_smoothing must be in (0, 1]");
        }
        if self.content_safety.enabled
            && (self.content_safety.timeout_secs == 0 || self.content_safety.max_in_flight == 0)
        {
            return invalid("content_safety limits must be non-zero");
        }
        self.primary_override()?;
        self.fallbacks()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.server.bind_address.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "invalid bind address {:?}",
                self.server.bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn primary_override(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.upstream.primary.as_deref().map(parse_server).transpose()
    }

    pub fn fallbacks(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.upstream.fallbacks.iter().map(|s| parse_server(s)).collect()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.timeout_ms)
    }

    pub fn resolution_budget(&self) -> Duration {
        Duration::from_millis(self.upstream.budget_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.server.stats_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.server.purge_interval_secs)
    }

    pub fn content_safety_timeout(&self) -> Duration {
        Duration::from_secs(self.content_safety.timeout_secs)
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            failure_threshold: self.upstream.failure_threshold,
            cooldown: Duration::from_secs(self.upstream.cooldown_secs),
            latency_smoothing: self.upstream.latency_smoothing,
        }
    }
}

/// Parse "1.1.1.1", "1.1.1.1:5353", "2606:4700::1111" or
/// "[2606:4700::1111]:53". A bare address gets port 53.
pub fn parse_server(s: &str) -> Result<SocketAddr, ConfigError> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| ConfigError::Validation(format!("invalid upstream server {s:?}")))
}
