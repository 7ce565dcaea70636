//! Client configuration
//!
//! Provides centralized configuration for all components, loaded from TOML
//! with environment overrides for endpoint selection.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Sample rate spoken on the wire in both directions
pub const WIRE_SAMPLE_RATE: u32 = 24_000;

/// Highest sample rate accepted in configuration
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Frames per captured block
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

const DEPLOYMENT_ENV: &str = "VOICELINK_DEPLOYMENT";
const ENDPOINT_ENV: &str = "VOICELINK_ENDPOINT";

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("failed to read {path}: {error}")]
    Io { path: String, error: String },

    #[error("failed to parse {path}: {error}")]
    Parse { path: String, error: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the voice service is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    #[default]
    Local,
    Remote,
}

impl std::str::FromStr for Deployment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Deployment::Local),
            "remote" => Ok(Deployment::Remote),
            other => Err(ConfigError::Invalid(format!("unknown deployment '{}'", other))),
        }
    }
}

/// Configuration for a voice client
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Which endpoint to use
    pub deployment: Deployment,

    /// Endpoint used for local development
    pub local_endpoint: String,

    /// Endpoint used for the hosted service
    pub remote_endpoint: String,

    /// Explicit endpoint, wins over the deployment choice when set
    pub endpoint_override: Option<String>,

    /// Wire sample rate for capture and playback
    pub sample_rate: u32,

    /// Frames per outbound audio block
    pub block_size: usize,

    /// Capacity (in device callbacks) of the realtime -> encoder channel
    pub capture_queue_blocks: usize,

    /// Fixed delay between reconnection attempts
    pub reconnect_delay_ms: u64,

    /// How long to wait for the `ready` handshake
    pub handshake_timeout_ms: u64,

    /// Idle interval before a keepalive ping, 0 disables
    pub keepalive_interval_secs: u64,

    /// Play the rising tones when recording starts
    pub chime: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            deployment: Deployment::Local,
            local_endpoint: "ws://127.0.0.1:8000/ws/voice".to_string(),
            remote_endpoint: "wss://voice.example.com/ws/voice".to_string(),
            endpoint_override: None,
            sample_rate: WIRE_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            capture_queue_blocks: 32,
            reconnect_delay_ms: 2000,
            handshake_timeout_ms: 10_000,
            keepalive_interval_secs: 15,
            chime: true,
        }
    }
}

impl ClientConfig {
    /// Load a configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                error,
            },
            other => other,
        })
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the user config directory, falling back to defaults,
    /// then apply environment overrides
    pub fn load_default() -> Result<Self, ConfigError> {
        let config = match Self::default_path() {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                Self::load(path)?
            }
            _ => {
                debug!("No configuration file, using defaults");
                Self::default()
            }
        };
        config.with_env_overrides()
    }

    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("voicelink").join("config.toml"))
    }

    /// Apply `VOICELINK_DEPLOYMENT` and `VOICELINK_ENDPOINT`
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = std::env::var(DEPLOYMENT_ENV) {
            self.deployment = value.parse()?;
        }
        if let Ok(value) = std::env::var(ENDPOINT_ENV) {
            if !value.trim().is_empty() {
                self.endpoint_override = Some(value);
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// The endpoint to connect to
    pub fn endpoint(&self) -> &str {
        if let Some(ref endpoint) = self.endpoint_override {
            return endpoint;
        }
        match self.deployment {
            Deployment::Local => &self.local_endpoint,
            Deployment::Remote => &self.remote_endpoint,
        }
    }

    /// Set an explicit endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    /// Select the deployment
    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployment = deployment;
        self
    }

    /// Set the reconnection delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the outbound block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Disable the keepalive ping
    pub fn without_keepalive(mut self) -> Self {
        self.keepalive_interval_secs = 0;
        self
    }

    /// Disable the recording cue
    pub fn without_chime(mut self) -> Self {
        self.chime = false;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.endpoint();
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                endpoint
            )));
        }
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(ConfigError::Invalid(format!(
                "sample rate must be between 1 and {} Hz, got {}",
                MAX_SAMPLE_RATE, self.sample_rate
            )));
        }
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block size must be greater than 0".into()));
        }
        if self.capture_queue_blocks == 0 {
            return Err(ConfigError::Invalid(
                "capture queue must hold at least one block".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake timeout must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.sample_rate, 24_000);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.endpoint(), "ws://127.0.0.1:8000/ws/voice");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deployment_selects_endpoint() {
        let config = ClientConfig::default().with_deployment(Deployment::Remote);
        assert_eq!(config.endpoint(), "wss://voice.example.com/ws/voice");

        let config = config.with_endpoint("ws://10.0.0.2:9000/ws");
        assert_eq!(config.endpoint(), "ws://10.0.0.2:9000/ws");
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ClientConfig::from_toml(
            r#"
            deployment = "remote"
            remote_endpoint = "wss://voice.internal/ws"
            reconnect_delay_ms = 500
            chime = false
            "#,
        )
        .unwrap();

        assert_eq!(config.deployment, Deployment::Remote);
        assert_eq!(config.endpoint(), "wss://voice.internal/ws");
        assert_eq!(config.reconnect_delay(), Duration::from_millis(500));
        assert!(!config.chime);
        // Untouched fields keep their defaults
        assert_eq!(config.block_size, 4096);
    }

    #[test]
    fn test_from_toml_rejects_bad_endpoint() {
        let result = ClientConfig::from_toml(r#"local_endpoint = "http://localhost""#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientConfig::load("/nonexistent/voicelink/config.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("voicelink_config_test.toml");
        fs::write(&path, "block_size = 2048\nkeepalive_interval_secs = 0\n").unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.block_size, 2048);
        assert!(config.keepalive_interval().is_none());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_deployment_parse() {
        assert_eq!("Remote".parse::<Deployment>().unwrap(), Deployment::Remote);
        assert!("staging".parse::<Deployment>().is_err());
    }

    #[test]
    fn test_validate_zero_block() {
        let config = ClientConfig::default().with_block_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_sample_rate_bounds() {
        let config = ClientConfig::from_toml("sample_rate = 4000000000").unwrap_err();
        assert!(matches!(config, ConfigError::Invalid(_)));

        let config = ClientConfig::from_toml("sample_rate = 48000").unwrap();
        assert_eq!(config.sample_rate, 48_000);
    }
}
