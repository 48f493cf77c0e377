//! Network configuration types for the rpcweb server.

use std::path::PathBuf;
use std::time::Duration;

use rpcweb_core::frame::DEFAULT_MAX_MESSAGE_SIZE;

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
    /// Per-connection settings.
    pub connection: ConnectionConfig,
    /// Allowed CORS origins; `"*"` allows any. Empty disables origin checks.
    pub cors_origins: Vec<String>,
    /// Static file serving for GET requests; `None` answers every GET with 404.
    pub static_files: Option<StaticFilesConfig>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            connection: ConnectionConfig::default(),
            cors_origins: Vec::new(),
            static_files: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file.
    pub cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub key_path: PathBuf,
}

/// Root directory and extra response headers for static files.
#[derive(Debug, Clone)]
pub struct StaticFilesConfig {
    pub root: PathBuf,
    /// Added to every successful static response.
    pub headers: Vec<(String, String)>,
}

impl StaticFilesConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            headers: Vec::new(),
        }
    }
}

/// Per-connection limits for upgraded socket connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest reassembled message accepted from a socket.
    pub max_message_size: usize,
    /// Maximum time to wait when writing a reply frame.
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert!(config.tls.is_none());
        assert!(config.cors_origins.is_empty());
        assert!(config.static_files.is_none());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024 * 1024);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
    }

    #[test]
    fn static_files_start_without_headers() {
        let files = StaticFilesConfig::new("/srv/www");
        assert_eq!(files.root, PathBuf::from("/srv/www"));
        assert!(files.headers.is_empty());
    }
}
