//! Configuration file parser for Burrow
//!
//! Supports burrow.yml with tunnel server, local origin, and worker
//! pool settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default timeout applied to each origin timeout knob left unset.
pub const TEN_SECONDS: u64 = 10;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel server URL
    #[serde(default = "default_server")]
    pub server: String,

    /// Local origin settings
    #[serde(default)]
    pub local_server: LocalServerConfig,

    /// Worker pool settings
    #[serde(default)]
    pub pools: PoolsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            local_server: LocalServerConfig::default(),
            pools: PoolsConfig::default(),
        }
    }
}

/// The local HTTP service exposed through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalServerConfig {
    /// Base URL of the origin, e.g. http://127.0.0.1:8000
    #[serde(default = "default_local_url")]
    pub url: String,

    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for LocalServerConfig {
    fn default() -> Self {
        Self {
            url: default_local_url(),
            connect_timeout_secs: TEN_SECONDS,
            read_timeout_secs: TEN_SECONDS,
            write_timeout_secs: TEN_SECONDS,
        }
    }
}

impl LocalServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// What a pool does once every permit is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a permit
    #[default]
    Queue,
    /// Drop the task with a warning
    Reject,
}

/// Single worker pool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Per-concern worker pools. Sizes default to the caps used by the
/// upstream protocol (60/60/300).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default = "default_small_pool")]
    pub registration: PoolConfig,

    #[serde(default = "default_small_pool")]
    pub liveness: PoolConfig,

    #[serde(default = "default_request_pool")]
    pub request: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            registration: default_small_pool(),
            liveness: default_small_pool(),
            request: default_request_pool(),
        }
    }
}

fn default_server() -> String {
    "ws://localhost:8080/tunnel".to_string()
}

fn default_local_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_timeout() -> u64 {
    TEN_SECONDS
}

fn default_small_pool() -> PoolConfig {
    PoolConfig { size: 60, overflow: OverflowPolicy::Queue }
}

fn default_request_pool() -> PoolConfig {
    PoolConfig { size: 300, overflow: OverflowPolicy::Queue }
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.server.starts_with("ws://") && !self.server.starts_with("wss://") {
            anyhow::bail!("Server URL must be ws:// or wss://, got '{}'", self.server);
        }

        if self.local_server.url.is_empty() {
            anyhow::bail!("Local server URL cannot be empty");
        }

        for (name, pool) in [
            ("registration", &self.pools.registration),
            ("liveness", &self.pools.liveness),
            ("request", &self.pools.request),
        ] {
            if pool.size == 0 {
                anyhow::bail!("Pool '{}' must have a non-zero size", name);
            }
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = [
            "burrow.yml",
            "burrow.yaml",
            ".burrow.yml",
            ".burrow.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
server: wss://tunnel.example.com/tunnel
local_server:
  url: http://127.0.0.1:3000
  read_timeout_secs: 30
pools:
  request:
    size: 64
    overflow: reject
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server, "wss://tunnel.example.com/tunnel");
        assert_eq!(config.local_server.url, "http://127.0.0.1:3000");
        assert_eq!(config.local_server.read_timeout_secs, 30);
        assert_eq!(config.local_server.connect_timeout_secs, TEN_SECONDS);
        assert_eq!(config.pools.request.size, 64);
        assert_eq!(config.pools.request.overflow, OverflowPolicy::Reject);
        assert_eq!(config.pools.liveness.size, 60);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.local_server.connect_timeout_secs, TEN_SECONDS);
        assert_eq!(config.local_server.write_timeout_secs, TEN_SECONDS);
        assert_eq!(config.pools.request.size, 300);
        assert_eq!(config.pools.registration.overflow, OverflowPolicy::Queue);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_server_scheme() {
        let config = ClientConfig {
            server: "http://not-a-socket".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sized_pool() {
        let mut config = ClientConfig::default();
        config.pools.request.size = 0;
        assert!(config.validate().is_err());
    }
}
