//! TOML configuration for a dhcpload run.
//!
//! Every section has compiled-in defaults matching a small single-interface
//! test rig (5 workers, 5 transactions/s, 2 s deadline), so an empty file or
//! no file at all yields a usable configuration.  CLI flags are applied on top
//! by `main.rs`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "DHCPLOAD_CONFIG";
/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/dhcpload/dhcpload.toml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("engine.workers must be at least 1")]
    NoWorkers,

    #[error("rate.per_second must be a positive number (got {0})")]
    InvalidRate(f64),

    #[error("rate.burst must be at least 1")]
    ZeroBurst,

    #[error("session.deadline_ms must be at least 1")]
    ZeroDeadline,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a load run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LoadConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (the `--config` flag); failing to load it is an error.
    /// 2. The path in `DHCPLOAD_CONFIG`.
    /// 3. `/etc/dhcpload/dhcpload.toml`.
    /// 4. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "DHCPLOAD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !self.rate.per_second.is_finite() || self.rate.per_second <= 0.0 {
            return Err(ConfigError::InvalidRate(self.rate.per_second));
        }
        if self.rate.burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        if self.session.deadline_ms == 0 {
            return Err(ConfigError::ZeroDeadline);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent workers, each with its own socket.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { workers: 5 }
    }
}

// ---------------------------------------------------------------------------
// Rate
// ---------------------------------------------------------------------------

/// Aggregate admission rate shared by all workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Sustained transaction starts per second.
    pub per_second: f64,
    /// Maximum starts admitted back-to-back.
    pub burst: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_second: 5.0,
            burst: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// End-to-end budget from DISCOVER sent to ACK received (milliseconds).
    pub deadline_ms: u64,
    /// Whether to RELEASE the lease after the ACK.
    pub send_release: bool,
}

impl SessionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 2000,
            send_release: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interface to pin sockets to (`SO_BINDTODEVICE`, Linux only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Local address the client sockets bind to.
    pub bind_address: Ipv4Addr,
    /// Local UDP port (68 for a real DHCP client).
    pub client_port: u16,
    /// Where DISCOVER/REQUEST/RELEASE are sent.
    pub server_address: SocketAddr,
    /// Emit a warning every N consecutive transport failures in a worker.
    pub transport_error_warn_threshold: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            interface: None,
            bind_address: Ipv4Addr::UNSPECIFIED,
            client_port: 68,
            server_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 67)),
            transport_error_warn_threshold: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` for Prometheus scrapes.
    pub enabled: bool,
    pub listen_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 2112)),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
