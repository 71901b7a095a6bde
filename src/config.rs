//! Gateway Configuration
//!
//! TOML (or YAML) configuration for the listeners, the upstream resolver, the ticket
//! ledger and tunnel metering. Every section has defaults, so an empty file
//! is a valid (if certificate-less) configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::dns::resolver::DEFAULT_FAILOVER_MULTIPLIER;
use crate::dns::upstream::DEFAULT_UPSTREAM;

/// Header a trusted failover ingress uses to pass the real client address
pub const DEFAULT_FAILOVER_HEADER: &str = "zns-real-addr";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub resolver: ResolverConfig,
    pub ledger: LedgerConfig,
    pub tunnel: TunnelConfig,
    pub tickets: TicketConfig,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tls_needed = self.server.https_addr.is_some() || self.server.dot_addr.is_some();
        if tls_needed {
            if self.server.cert_path.is_none() {
                return Err(ConfigError::Invalid(
                    "server.cert_path is required for HTTPS and DoT listeners".to_string(),
                ));
            }
            if self.server.key_path.is_none() {
                return Err(ConfigError::Invalid(
                    "server.key_path is required for HTTPS and DoT listeners".to_string(),
                ));
            }
        }

        if self.server.https_addr.is_none() && self.server.http_addr.is_none() && self.server.dot_addr.is_none() {
            return Err(ConfigError::Invalid("no listener configured".to_string()));
        }

        if self.resolver.upstream.trim().is_empty() {
            return Err(ConfigError::Invalid("resolver.upstream must not be empty".to_string()));
        }

        if self.resolver.failover_multiplier <= 0 {
            return Err(ConfigError::Invalid(
                "resolver.failover_multiplier must be > 0".to_string(),
            ));
        }

        if self.tunnel.cost_multiplier <= 0 {
            return Err(ConfigError::Invalid("tunnel.cost_multiplier must be > 0".to_string()));
        }

        if self.tunnel.meter_interval_ms == 0 {
            return Err(ConfigError::Invalid("tunnel.meter_interval_ms must be > 0".to_string()));
        }

        if self.tunnel.dial_timeout_secs == 0 {
            return Err(ConfigError::Invalid("tunnel.dial_timeout_secs must be > 0".to_string()));
        }

        if self.tickets.mib_per_cny <= 0 {
            return Err(ConfigError::Invalid("tickets.mib_per_cny must be > 0".to_string()));
        }

        if !self.ledger.free && self.ledger.db_path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ledger.db_path is required unless ledger.free is set".to_string(),
            ));
        }

        Ok(())
    }

    /// Load a config file. `.yaml` and `.yml` files are read as YAML,
    /// anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_toml(&content),
        }
    }

    /// Load configuration from TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from YAML
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTPS listener (DoH, tunnels, ticket API)
    pub https_addr: Option<SocketAddr>,
    /// Plain HTTP listener, for use behind a TLS-terminating ingress
    pub http_addr: Option<SocketAddr>,
    /// DNS over TLS listener
    pub dot_addr: Option<SocketAddr>,
    /// TLS certificate chain (PEM)
    pub cert_path: Option<String>,
    /// TLS private key (PEM)
    pub key_path: Option<String>,
    /// Alt-Svc header value added to every HTTP response
    pub alt_svc: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            https_addr: Some(SocketAddr::from(([0, 0, 0, 0], 443))),
            http_addr: None,
            dot_addr: None,
            cert_path: None,
            key_path: None,
            alt_svc: None,
        }
    }
}

/// Upstream resolver and query policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Upstream DoH endpoint
    pub upstream: String,
    /// Trusted header carrying the client address of relayed queries
    pub failover_header: String,
    /// Cost multiplier for relayed queries
    pub failover_multiplier: i64,
    /// Ad-domain list used for `noad` queries
    pub blocklist_path: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            upstream: DEFAULT_UPSTREAM.to_string(),
            failover_header: DEFAULT_FAILOVER_HEADER.to_string(),
            failover_multiplier: DEFAULT_FAILOVER_MULTIPLIER,
            blocklist_path: None,
        }
    }
}

/// Ticket ledger backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Give every token a fixed balance and persist nothing
    pub free: bool,
    /// SQLite database path
    pub db_path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            free: false,
            db_path: "zns.db".to_string(),
        }
    }
}

/// Tunnel metering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Debit multiplier applied to bytes counted on the upstream leg
    pub cost_multiplier: i64,
    /// Meter flush period (milliseconds)
    pub meter_interval_ms: u64,
    /// Upstream dial timeout (seconds)
    pub dial_timeout_secs: u64,
}

impl TunnelConfig {
    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            cost_multiplier: 2,
            meter_interval_ms: 1000,
            dial_timeout_secs: 5,
        }
    }
}

/// Ticket purchase pricing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    /// MiB granted per CNY paid
    pub mib_per_cny: i64,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self { mib_per_cny: 1024 }
    }
}
