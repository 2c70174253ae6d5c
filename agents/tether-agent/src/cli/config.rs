//! Configuration module
//!
//! Handles loading and validating agent configuration from TOML files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Main configuration structure for the Tether Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name the agent registers under
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Unique identifier for this agent
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Supervisor connection settings
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Artifact cache settings
    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Supervisor connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// WebSocket URL of the supervisor
    #[serde(default = "default_control_plane_url")]
    pub url: String,

    /// API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,

    /// Reconnect interval in milliseconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Capacity of the outbound message queue
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Artifact cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Directory holding cached artifacts, one file per content hash
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Timeout for artifact fetches over the control link
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Base URL of an HTTP artifact store consulted before the control link
    #[serde(default)]
    pub http_base_url: Option<String>,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime type (docker, memory)
    #[serde(default = "default_runtime_type")]
    pub runtime_type: String,

    /// Docker socket path
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,

    /// Network unit containers are attached to
    #[serde(default)]
    pub default_network: Option<String>,
}

/// Refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// How long an operation waits for an outstanding refresh
    #[serde(default = "default_refresh_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_agent_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_agent_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_control_plane_url() -> String {
    "ws://localhost:8080".to_string()
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/tether/cache")
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_runtime_type() -> String {
    "docker".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_refresh_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_control_plane_url(),
            api_key: None,
            reconnect_interval_ms: default_reconnect_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            fetch_timeout_secs: default_fetch_timeout(),
            http_base_url: None,
        }
    }
}

impl ArtifactsConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: default_runtime_type(),
            docker_socket: default_docker_socket(),
            default_network: None,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_refresh_timeout(),
        }
    }
}

impl RefreshConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            agent_name: default_agent_name(),
            agent_id: default_agent_id(),
            control_plane: ControlPlaneConfig::default(),
            artifacts: ArtifactsConfig::default(),
            runtime: RuntimeConfig::default(),
            refresh: RefreshConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        match self.runtime.runtime_type.as_str() {
            "docker" | "memory" => {}
            other => bail!("Unsupported runtime type: {}", other),
        }
        match self.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => bail!("Unsupported log format: {}", other),
        }
        if self.control_plane.outbox_capacity == 0 {
            bail!("control_plane.outbox_capacity must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default_config();
        assert!(!config.agent_id.is_empty());
        assert!(!config.agent_name.is_empty());
        assert_eq!(config.control_plane.url, "ws://localhost:8080");
        assert_eq!(config.runtime.runtime_type, "docker");
        assert_eq!(config.refresh.timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_content = r#"
            agent_name = "edge-7"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.agent_name, "edge-7");
        assert_eq!(config.control_plane.url, "ws://localhost:8080");
        assert!(config.artifacts.http_base_url.is_none());
    }

    #[test]
    fn test_parse_sections() {
        let toml_content = r#"
            [artifacts]
            cache_dir = "/tmp/tether"
            http_base_url = "http://artifacts.local"

            [runtime]
            runtime_type = "memory"

            [refresh]
            timeout_secs = 5
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.artifacts.cache_dir, PathBuf::from("/tmp/tether"));
        assert_eq!(config.artifacts.fetch_timeout_secs, 60);
        assert_eq!(config.runtime.runtime_type, "memory");
        assert_eq!(config.refresh.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_unknown_runtime() {
        let mut config = Config::default_config();
        config.runtime.runtime_type = "podman".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let mut config = Config::default_config();
        config.agent_name = "saved".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.agent_name, "saved");
        assert_eq!(loaded.agent_id, config.agent_id);
    }
}
