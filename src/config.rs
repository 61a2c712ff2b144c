//! Server configuration from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::auth::token::DEFAULT_TOKEN_TTL_SECONDS;
use crate::sync::SyncConfig;

/// Errors that can occur while reading configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Runtime configuration of the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Directory holding one subdirectory per project
    pub projects_root: PathBuf,
    /// Signing secret for invite tokens; random per process when unset
    pub token_secret: Option<String>,
    pub token_ttl_seconds: u64,
    /// Project-scoped HTTP endpoints demand a token from non-loopback callers
    pub require_token: bool,
    /// Honour `X-Forwarded-For` (only behind a trusted reverse proxy)
    pub trust_forwarded_for: bool,
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
            projects_root: PathBuf::from("./data/projects"),
            token_secret: None,
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            require_token: true,
            trust_forwarded_for: false,
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(value) = var("BIND_ADDR") {
            config.bind_addr = parse("BIND_ADDR", &value)?;
        }
        if let Some(value) = var("PORT") {
            config.port = parse("PORT", &value)?;
        }
        if let Some(value) = var("PROJECTS_ROOT") {
            config.projects_root = PathBuf::from(value);
        }
        config.token_secret = var("COLLAB_TOKEN_SECRET");
        if let Some(value) = var("COLLAB_TOKEN_TTL") {
            config.token_ttl_seconds = parse("COLLAB_TOKEN_TTL", &value)?;
        }
        if let Some(value) = var("COLLAB_REQUIRE_TOKEN") {
            config.require_token = parse_flag("COLLAB_REQUIRE_TOKEN", &value)?;
        }
        if let Some(value) = var("COLLAB_TRUST_FORWARDED_FOR") {
            config.trust_forwarded_for = parse_flag("COLLAB_TRUST_FORWARDED_FOR", &value)?;
        }
        if let Some(value) = var("COLLAB_FLUSH_DEBOUNCE_MS") {
            config.sync.flush_debounce = Duration::from_millis(parse("COLLAB_FLUSH_DEBOUNCE_MS", &value)?);
        }
        if let Some(value) = var("COLLAB_EVICTION_GRACE_SECS") {
            config.sync.eviction_grace = Duration::from_secs(parse("COLLAB_EVICTION_GRACE_SECS", &value)?);
        }
        if let Some(value) = var("COLLAB_PRESENCE_TIMEOUT_SECS") {
            let timeout: u64 = parse("COLLAB_PRESENCE_TIMEOUT_SECS", &value)?;
            if timeout == 0 {
                return Err(invalid("COLLAB_PRESENCE_TIMEOUT_SECS", &value));
            }
            config.sync.presence_timeout = Duration::from_secs(timeout);
            // Sweep twice per timeout window
            config.sync.presence_sweep_interval = config.sync.presence_timeout / 2;
        }

        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Set the projects directory
    pub fn with_projects_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.projects_root = root.into();
        self
    }

    /// Set the token secret
    pub fn with_token_secret(mut self, secret: impl Into<String>) -> Self {
        self.token_secret = Some(secret.into());
        self
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}
