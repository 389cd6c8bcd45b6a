//! Server and client configuration

use crate::frame::FrameFormat;
use crate::{
    CLIENT_FRAME_LIMIT, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
    DEFAULT_SESSION_TIMEOUT, SERVER_FRAME_LIMIT,
};
use filemove_transport::TransportConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending setting
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Codec and streaming options shared by both ends of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Frame encoding
    pub format: FrameFormat,

    /// Largest frame accepted from the peer, in bytes
    pub frame_limit: usize,

    /// Streaming buffer size
    pub chunk_size: usize,
}

impl TransferOptions {
    /// Options for the serving side
    pub fn server() -> Self {
        Self {
            format: FrameFormat::Delimited,
            frame_limit: SERVER_FRAME_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Options for the requesting side
    pub fn client() -> Self {
        Self {
            frame_limit: CLIENT_FRAME_LIMIT,
            ..Self::server()
        }
    }

    /// Validate the options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_limit < 64 {
            return Err(ConfigError::invalid(
                "frame_limit",
                format!("{} is below the 64-byte minimum", self.frame_limit),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", "must be non-zero"));
        }
        Ok(())
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::server()
    }
}

/// Admission control configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Sessions served at once; further connections wait
    pub max_connections: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds
    pub listen_addr: SocketAddr,

    /// Root of the per-user storage tree
    pub storage_root: PathBuf,

    /// Admission control
    pub admission: AdmissionConfig,

    /// Frame codec and streaming
    pub transfer: TransferOptions,

    /// Socket and TLS handshake settings
    pub transport: TransportConfig,

    /// Longest a session may go without progress, `None` for no limit
    pub session_timeout: Option<Duration>,

    /// Reject frames naming a user other than the server's identity
    pub enforce_session_identity: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            storage_root: PathBuf::from("."),
            admission: AdmissionConfig::default(),
            transfer: TransferOptions::server(),
            transport: TransportConfig::default(),
            session_timeout: Some(DEFAULT_SESSION_TIMEOUT),
            enforce_session_identity: false,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.max_connections == 0 {
            return Err(ConfigError::invalid(
                "max_connections",
                "at least one connection must be admitted",
            ));
        }
        if self.session_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("session_timeout", "must be non-zero"));
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("storage_root", "must not be empty"));
        }
        self.transfer.validate()
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`
    pub server_addr: String,

    /// Name the server's certificate is checked against; defaults to the host
    /// part of `server_addr`
    pub server_name: Option<String>,

    /// Directory downloads are written under
    pub download_root: PathBuf,

    /// Frame codec and streaming
    pub transfer: TransferOptions,

    /// Connect and TLS handshake settings
    pub transport: TransportConfig,

    /// Longest a session may go without progress, `None` for no limit
    pub session_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("localhost:{DEFAULT_PORT}"),
            server_name: None,
            download_root: PathBuf::from("."),
            transfer: TransferOptions::client(),
            transport: TransportConfig::default(),
            session_timeout: Some(DEFAULT_SESSION_TIMEOUT),
        }
    }
}

impl ClientConfig {
    /// Name to verify the server certificate against
    pub fn server_name(&self) -> &str {
        if let Some(name) = &self.server_name {
            return name;
        }
        host_part(&self.server_addr)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some((host, port)) = self.server_addr.rsplit_once(':') else {
            return Err(ConfigError::invalid(
                "server_addr",
                format!("'{}' is not host:port", self.server_addr),
            ));
        };
        if host.is_empty() {
            return Err(ConfigError::invalid("server_addr", "host is empty"));
        }
        if port.parse::<u16>().is_err() {
            return Err(ConfigError::invalid(
                "server_addr",
                format!("invalid port '{port}'"),
            ));
        }
        if self.session_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("session_timeout", "must be non-zero"));
        }
        self.transfer.validate()
    }
}

fn host_part(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.listen_addr.port(), 8080);
        assert_eq!(server.admission.max_connections, 10);
        assert_eq!(server.transfer.frame_limit, 2048);
        assert!(!server.enforce_session_identity);
        assert!(server.validate().is_ok());

        let client = ClientConfig::default();
        assert_eq!(client.transfer.frame_limit, 4096);
        assert_eq!(client.transfer.format, FrameFormat::Delimited);
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_server_validation() {
        let mut config = ServerConfig::default();
        config.admission.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "max_connections",
                ..
            })
        ));

        let mut config = ServerConfig::default();
        config.session_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_validation() {
        let mut config = ClientConfig::default();
        for bad in ["localhost", ":8080", "host:port", "host:70000"] {
            config.server_addr = bad.to_string();
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
        config.server_addr = "[::1]:8080".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_name_derivation() {
        let mut config = ClientConfig::default();
        config.server_addr = "files.example.com:9000".to_string();
        assert_eq!(config.server_name(), "files.example.com");

        config.server_addr = "[::1]:9000".to_string();
        assert_eq!(config.server_name(), "::1");

        config.server_name = Some("override.example".to_string());
        assert_eq!(config.server_name(), "override.example");
    }
}
