//! Core configuration types.
//!
//! [`Config`] carries everything [`bootstrap`](crate::bootstrap::bootstrap)
//! needs to bind both protocol servers and open the coordinator. The server
//! binary builds one from its YAML file and environment; tests use
//! [`Config::ephemeral`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::WakeMode;
use crate::protocol_constants::{
    DEFAULT_HTTP_PORT, DEFAULT_MAX_CONNECTIONS, DEFAULT_POLL_TIMEOUT_MS, DEFAULT_READ_CHUNK,
    DEFAULT_SLIM_PORT, DEFAULT_WRITE_CHUNK,
};

/// Configuration for one reactor (one listening socket, one thread).
///
/// Groups the parameters that bound the reactor's resource use and latency.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReactorConfig {
    /// Address the listening socket binds to.
    pub bind_addr: IpAddr,

    /// Port the listening socket binds to (0 = auto-allocate).
    pub port: u16,

    /// Maximum number of live connections. Connections beyond this are
    /// accepted and immediately closed.
    pub max_connections: usize,

    /// Upper bound on the blocking readiness wait (milliseconds).
    pub poll_timeout_ms: u64,

    /// Bytes read from a socket per read call.
    pub read_chunk: usize,

    /// Bytes drained from the head output source per write pass.
    pub write_chunk: usize,
}

impl ReactorConfig {
    /// Creates a reactor configuration for `port` with default limits.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be >= 1".to_string());
        }
        if self.poll_timeout_ms == 0 {
            return Err(
                "poll_timeout_ms must be >= 1 (a zero timeout turns the reactor into a busy loop)"
                    .to_string(),
            );
        }
        if self.read_chunk == 0 {
            return Err("read_chunk must be >= 1".to_string());
        }
        if self.write_chunk == 0 {
            return Err("write_chunk must be >= 1".to_string());
        }
        Ok(())
    }

    /// Socket address the listener binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            read_chunk: DEFAULT_READ_CHUNK,
            write_chunk: DEFAULT_WRITE_CHUNK,
        }
    }
}

/// Configuration for the Tandem server.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    // Servers
    /// HTTP reactor configuration.
    pub http: ReactorConfig,

    /// Device-protocol reactor configuration.
    pub slim: ReactorConfig,

    /// How the coordinator interrupts a reactor's readiness wait.
    pub wake_mode: WakeMode,

    // Storage
    /// Directory holding persisted playlists and player settings.
    /// `None` keeps all state in memory.
    pub data_dir: Option<PathBuf>,

    /// Directory served under `/` and `/html/`.
    pub html_root: PathBuf,
}

impl Config {
    /// Configuration for tests: both servers on loopback with auto-allocated
    /// ports and no persistence.
    pub fn ephemeral() -> Self {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            http: ReactorConfig {
                bind_addr: loopback,
                ..ReactorConfig::default()
            },
            slim: ReactorConfig {
                bind_addr: loopback,
                ..ReactorConfig::default()
            },
            data_dir: None,
            ..Self::default()
        }
    }

    /// Validates both reactor configurations.
    pub fn validate(&self) -> Result<(), String> {
        self.http.validate().map_err(|e| format!("http: {e}"))?;
        self.slim.validate().map_err(|e| format!("slim: {e}"))?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: ReactorConfig::with_port(DEFAULT_HTTP_PORT),
            slim: ReactorConfig::with_port(DEFAULT_SLIM_PORT),
            wake_mode: WakeMode::default(),
            data_dir: Some(PathBuf::from("./data")),
            html_root: PathBuf::from("./html"),
        }
    }
}
