//! Configuration management for the transport client.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{MgTransportError, Result};

/// Prefix for environment overrides, e.g. `MG_TRANSPORT__CLIENT__DEBUG=true`.
const ENV_PREFIX: &str = "MG_TRANSPORT";

/// Main configuration for the transport client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Per-client dispatch settings
    #[serde(default)]
    pub client: ClientSettings,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Client pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Dispatch settings applied to every request a client issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Transport timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of response bytes read into memory
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,

    /// Extra attempts after a "too many requests" response
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Emit request/response traces through the log sink
    #[serde(default)]
    pub debug: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_response_size: default_max_response_size(),
            max_retries: default_max_retries(),
            debug: false,
        }
    }
}

impl ClientSettings {
    /// Transport timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_response_size() -> usize {
    10 << 20
}

fn default_max_retries() -> u32 {
    3
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per identity within one window
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Idle time in seconds after which an identity is forgotten
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,

    /// How often the eviction sweep runs, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Number of shards (0 picks twice the available parallelism)
    #[serde(default)]
    pub shards: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: default_max_requests(),
            window_ms: default_window_ms(),
            idle_eviction_secs: default_idle_eviction(),
            sweep_interval_secs: default_sweep_interval(),
            shards: 0,
        }
    }
}

impl RateLimitingConfig {
    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Idle eviction threshold as a duration.
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    1000
}

fn default_idle_eviction() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

/// Client pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of cached clients
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Lifetime of a cached client in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_secs: default_ttl(),
        }
    }
}

impl PoolConfig {
    /// Entry lifetime as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_capacity() -> usize {
    1000
}

fn default_ttl() -> u64 {
    3600
}

impl TransportConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TransportConfig = serde_yaml::from_str(&contents)
            .map_err(|e| MgTransportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional YAML file and
    /// `MG_TRANSPORT__*` environment variables, in that order of precedence.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading transport configuration");
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }
        let config: TransportConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MgTransportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the limiter or pool unusable.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.max_requests_per_window == 0 {
            return Err(MgTransportError::Config(
                "max_requests_per_window must be positive".into(),
            ));
        }
        if self.rate_limiting.window_ms == 0 {
            return Err(MgTransportError::Config("window_ms must be positive".into()));
        }
        if self.rate_limiting.idle_eviction() < self.rate_limiting.window() {
            return Err(MgTransportError::Config(
                "idle_eviction_secs must cover at least one window".into(),
            ));
        }
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(MgTransportError::Config(
                "sweep_interval_secs must be positive".into(),
            ));
        }
        if self.client.max_response_size == 0 {
            return Err(MgTransportError::Config(
                "max_response_size must be positive".into(),
            ));
        }
        if self.pool.capacity == 0 {
            return Err(MgTransportError::Config(
                crate::pool::NEGATIVE_CAPACITY.into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.client.timeout(), Duration::from_secs(60));
        assert_eq!(config.client.max_retries, 3);
        assert!(!config.client.debug);
        assert_eq!(config.rate_limiting.max_requests_per_window, 100);
        assert_eq!(config.rate_limiting.window(), Duration::from_secs(1));
        assert_eq!(config.pool.ttl(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
rate_limiting:
  max_requests_per_window: 5
client:
  debug: true
"#;
        let config: TransportConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rate_limiting.max_requests_per_window, 5);
        assert_eq!(config.rate_limiting.window_ms, 1000);
        assert!(config.client.debug);
        assert_eq!(config.pool.capacity, 1000);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = TransportConfig::default();
        config.pool.capacity = 0;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, MgTransportError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = TransportConfig::default();
        config.rate_limiting.window_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_quota() {
        let mut config = TransportConfig::default();
        config.rate_limiting.max_requests_per_window = 0;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, MgTransportError::Config(_)));
        assert!(err.to_string().contains("max_requests_per_window"));
    }

    #[test]
    fn test_validate_rejects_idle_threshold_below_window() {
        let mut config = TransportConfig::default();
        config.rate_limiting.idle_eviction_secs = 0;
        assert!(config.validate().is_err());

        config.rate_limiting.idle_eviction_secs = 1;
        config.rate_limiting.window_ms = 1000;
        assert!(config.validate().is_ok());

        config.rate_limiting.window_ms = 1500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let err = TransportConfig::from_file("/nonexistent/mg-transport.yaml").unwrap_err();
        assert!(matches!(err, MgTransportError::Io(_)));
    }

    #[test]
    fn test_load_without_file() {
        let config = TransportConfig::load(None).unwrap();
        assert_eq!(config.pool.ttl_secs, 3600);
    }
}
