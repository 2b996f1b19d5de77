//! Registry configuration.
//!
//! Configuration is built in code or loaded from environment variables with
//! sensible defaults.

use crate::error::HostError;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for [`ActivationHostRegistry`](crate::ActivationHostRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Period of the background heartbeat sweep (default: 1s).
    pub heartbeat_interval: Duration,
    /// Upper bound on a single heartbeat (default: 5s).
    pub heartbeat_timeout: Duration,
    /// Heartbeat attempts during the connect handshake (default: 4).
    pub connect_attempts: u32,
    /// First handshake backoff; doubled after every failure (default: 100ms).
    pub connect_backoff: Duration,
    /// Upper bound on stopping one host during shutdown (default: 5s).
    pub stop_timeout: Duration,
    /// Upper bound on one agent RPC round trip (default: 30s).
    pub call_timeout: Duration,
    /// Agent binary used for separate-process hosts.
    pub agent_path: PathBuf,
    /// Directory holding agent sockets.
    pub runtime_dir: PathBuf,
    /// Buffered fault events per broadcast subscriber (default: 64).
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_secs(5),
            connect_attempts: 4,
            connect_backoff: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            agent_path: PathBuf::from("isohost-agent"),
            runtime_dir: PathBuf::from("/tmp/isohost"),
            event_capacity: 64,
        }
    }
}

impl RegistryConfig {
    /// Create a new config builder.
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `ISOHOST_HEARTBEAT_INTERVAL_MS` | `1000` |
    /// | `ISOHOST_HEARTBEAT_TIMEOUT_MS` | `5000` |
    /// | `ISOHOST_CONNECT_ATTEMPTS` | `4` |
    /// | `ISOHOST_CONNECT_BACKOFF_MS` | `100` |
    /// | `ISOHOST_STOP_TIMEOUT_MS` | `5000` |
    /// | `ISOHOST_CALL_TIMEOUT_MS` | `30000` |
    /// | `ISOHOST_AGENT_PATH` | `isohost-agent` |
    /// | `ISOHOST_RUNTIME_DIR` | `/tmp/isohost` |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            heartbeat_interval: env_millis("ISOHOST_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(default.heartbeat_interval),
            heartbeat_timeout: env_millis("ISOHOST_HEARTBEAT_TIMEOUT_MS")
                .unwrap_or(default.heartbeat_timeout),
            connect_attempts: std::env::var("ISOHOST_CONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.connect_attempts),
            connect_backoff: env_millis("ISOHOST_CONNECT_BACKOFF_MS")
                .unwrap_or(default.connect_backoff),
            stop_timeout: env_millis("ISOHOST_STOP_TIMEOUT_MS").unwrap_or(default.stop_timeout),
            call_timeout: env_millis("ISOHOST_CALL_TIMEOUT_MS").unwrap_or(default.call_timeout),
            agent_path: std::env::var("ISOHOST_AGENT_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.agent_path),
            runtime_dir: std::env::var("ISOHOST_RUNTIME_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.runtime_dir),
            event_capacity: default.event_capacity,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), HostError> {
        if self.heartbeat_interval.is_zero() {
            return Err(HostError::Config("heartbeat_interval must be > 0".into()));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(HostError::Config("heartbeat_timeout must be > 0".into()));
        }
        if self.connect_attempts == 0 {
            return Err(HostError::Config("connect_attempts must be > 0".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(HostError::Config("call_timeout must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(HostError::Config("event_capacity must be > 0".into()));
        }
        if self.agent_path.as_os_str().is_empty() {
            return Err(HostError::Config("agent_path is required".into()));
        }
        Ok(())
    }

    /// Total time the connect handshake sleeps before giving up.
    pub fn handshake_budget(&self) -> Duration {
        (0..self.connect_attempts)
            .map(|attempt| self.connect_backoff * 2u32.saturating_pow(attempt))
            .sum()
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Builder for RegistryConfig.
#[derive(Debug, Default)]
pub struct RegistryConfigBuilder {
    config: RegistryConfig,
}

impl RegistryConfigBuilder {
    /// Set the sweep period.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the per-heartbeat timeout.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    /// Set the handshake attempt count.
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.config.connect_attempts = attempts;
        self
    }

    /// Set the initial handshake backoff.
    pub fn connect_backoff(mut self, backoff: Duration) -> Self {
        self.config.connect_backoff = backoff;
        self
    }

    /// Set the per-host stop timeout used at shutdown.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Set the agent RPC timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the agent binary.
    pub fn agent_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.agent_path = path.into();
        self
    }

    /// Set the socket directory.
    pub fn runtime_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.runtime_dir = path.into();
        self
    }

    /// Set the fault event buffer size.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<RegistryConfig, HostError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(config.connect_attempts, 4);
        assert_eq!(config.connect_backoff, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_handshake_budget() {
        let config = RegistryConfig::default();
        assert_eq!(config.handshake_budget(), Duration::from_millis(1500));
    }

    #[test]
    fn test_builder_rejects_zero_attempts() {
        let result = RegistryConfig::builder().connect_attempts(0).build();
        assert!(matches!(result, Err(HostError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_zero_interval() {
        let result = RegistryConfig::builder()
            .heartbeat_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = RegistryConfig::builder()
            .heartbeat_interval(Duration::from_millis(250))
            .connect_attempts(6)
            .agent_path("/opt/isohost/bin/isohost-agent")
            .runtime_dir("/run/isohost")
            .build()
            .expect("should build successfully");

        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.connect_attempts, 6);
        assert_eq!(
            config.agent_path,
            PathBuf::from("/opt/isohost/bin/isohost-agent")
        );
        assert_eq!(config.runtime_dir, PathBuf::from("/run/isohost"));
    }
}
