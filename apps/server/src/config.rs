//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tandem_core::protocol_constants::{
    DEFAULT_HTTP_PORT, DEFAULT_MAX_CONNECTIONS, DEFAULT_POLL_TIMEOUT_MS, DEFAULT_SLIM_PORT,
};
use tandem_core::{ReactorConfig, WakeMode};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to.
    pub bind_addr: IpAddr,

    /// HTTP port (streams, pages, status, control).
    /// Override: `TANDEM_HTTP_PORT`
    pub http_port: u16,

    /// Device-control port.
    /// Override: `TANDEM_SLIM_PORT`
    pub slim_port: u16,

    /// Maximum concurrent HTTP connections.
    pub http_max_connections: usize,

    /// Maximum concurrent device connections.
    pub slim_max_connections: usize,

    /// Upper bound on each reactor's readiness wait, in milliseconds.
    /// Override: `TANDEM_POLL_TIMEOUT_MS`
    pub poll_timeout_ms: u64,

    /// `waker` or `loopback`.
    pub wake_mode: WakeMode,

    /// Directory for playlists and player settings. Unset keeps state in memory.
    /// Override: `TANDEM_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Directory with the web UI.
    pub html_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: DEFAULT_HTTP_PORT,
            slim_port: DEFAULT_SLIM_PORT,
            http_max_connections: DEFAULT_MAX_CONNECTIONS,
            slim_max_connections: DEFAULT_MAX_CONNECTIONS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            wake_mode: WakeMode::default(),
            data_dir: Some(PathBuf::from("./data")),
            html_root: PathBuf::from("./html"),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_yaml(content: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TANDEM_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                self.http_port = port;
            }
        }

        if let Ok(val) = std::env::var("TANDEM_SLIM_PORT") {
            if let Ok(port) = val.parse() {
                self.slim_port = port;
            }
        }

        if let Ok(val) = std::env::var("TANDEM_POLL_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.poll_timeout_ms = ms;
            }
        }

        // Note: TANDEM_DATA_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to tandem-core's Config type.
    pub fn to_core_config(&self) -> tandem_core::Config {
        let reactor = |port, max_connections| ReactorConfig {
            bind_addr: self.bind_addr,
            port,
            max_connections,
            poll_timeout_ms: self.poll_timeout_ms,
            ..ReactorConfig::default()
        };
        tandem_core::Config {
            http: reactor(self.http_port, self.http_max_connections),
            slim: reactor(self.slim_port, self.slim_max_connections),
            wake_mode: self.wake_mode,
            data_dir: self.data_dir.clone(),
            html_root: self.html_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_core_defaults() {
        let core = ServerConfig::default().to_core_config();
        assert_eq!(core, tandem_core::Config::default());
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let config = ServerConfig::from_yaml(
            "http_port: 8080\nwake_mode: loopback\ndata_dir: null\npoll_timeout_ms: 500\n",
        )
        .unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.slim_port, DEFAULT_SLIM_PORT);
        assert_eq!(config.wake_mode, WakeMode::Loopback);
        assert!(config.data_dir.is_none());

        let core = config.to_core_config();
        assert_eq!(core.http.port, 8080);
        assert_eq!(core.slim.poll_timeout_ms, 500);
        assert_eq!(core.http.poll_timeout_ms, 500);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.yaml");
        std::fs::write(&path, "slim_port: 13483\n").unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.to_core_config().slim.port, 13483);
    }

    #[test]
    fn empty_or_invalid_files() {
        assert_eq!(ServerConfig::from_yaml("").unwrap().http_port, DEFAULT_HTTP_PORT);
        assert!(ServerConfig::from_yaml("http_port: [1, 2]").is_err());
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/tandem.yaml"))).is_err());
    }
}
