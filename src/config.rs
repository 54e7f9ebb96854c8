//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::admission::{ConnectionLimitRule, RateLimitRule, TrustedProxies};
use crate::error::{Result, TurnstileError};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Peers whose `X-Forwarded-For` header is honored
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,

    /// Concurrent in-flight limits
    #[serde(default)]
    pub connection_limits: Vec<ConnectionLimitRule>,

    /// Fixed-window rate limits
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRule>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Worker threads serving requests
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Largest request body accepted, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            workers: default_workers(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl TurnstileConfig {
    /// Parse and validate configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(contents).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with `TURNSTILE__*` environment
    /// variables layered on top (e.g. `TURNSTILE__SERVER__BIND_ADDR`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: TurnstileConfig = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("TURNSTILE").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid or conflicting options. Runs before any request is served.
    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            return Err(TurnstileError::Config(
                "server.workers must be greater than zero".to_string(),
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(TurnstileError::Config(
                "server.max_body_bytes must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let rule_names = self
            .connection_limits
            .iter()
            .map(|rule| rule.name.as_str())
            .chain(self.rate_limits.iter().map(|rule| rule.name.as_str()));
        for name in rule_names {
            if name.is_empty() {
                return Err(TurnstileError::Config("policy name must not be empty".to_string()));
            }
            if !names.insert(name) {
                return Err(TurnstileError::Config(format!(
                    "duplicate policy name '{}'",
                    name
                )));
            }
        }

        for rule in &self.connection_limits {
            rule.validate()?;
        }
        for rule in &self.rate_limits {
            rule.validate()?;
        }
        Ok(())
    }

    pub fn trusted_proxies(&self) -> TrustedProxies {
        TrustedProxies::new(self.trusted_proxies.iter().copied())
    }
}
