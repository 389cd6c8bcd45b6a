//! Configuration system for the FileMove CLI.

use filemove_core::{AdmissionConfig, ClientConfig, FrameFormat, ServerConfig, TransferOptions};
use filemove_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted admission capacity
const MAX_CONNECTIONS_LIMIT: usize = 10_000;

/// FileMove configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerSection,
    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
    /// TLS material and handshake settings
    #[serde(default)]
    pub tls: TlsSection,
    /// Wire protocol options
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Local identity store
    #[serde(default)]
    pub identity: IdentitySection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Root of the per-user storage tree
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Sessions served at once
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds a session may go without progress before it is dropped
    /// (0 disables it). Transfers that keep moving bytes are never cut off.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Reject frames naming another user than the logged-in one
    #[serde(default)]
    pub enforce_session_identity: bool,
    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Server address (`host:port`)
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Name the server certificate must carry
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Directory downloads are written under
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,
    /// Seconds a session may go without progress before it is dropped
    /// (0 disables it). Transfers that keep moving bytes are never cut off.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    /// Server certificate chain (PEM)
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    /// Server private key (PEM)
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Root certificate the client trusts (PEM)
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,
    /// TLS handshake timeout in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Wire protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// Frame format: `delimited` or `length-prefixed`
    #[serde(default = "default_frame_format")]
    pub frame_format: String,
    /// Streaming chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Identity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySection {
    /// JSON file holding username → password hash
    #[serde(default = "default_store_file")]
    pub store_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("FileMove-Storage")
}

fn default_max_connections() -> usize {
    filemove_core::DEFAULT_MAX_CONNECTIONS
}

fn default_session_timeout_secs() -> u64 {
    filemove_core::DEFAULT_SESSION_TIMEOUT.as_secs()
}

fn default_backlog() -> u32 {
    filemove_transport::DEFAULT_BACKLOG
}

fn default_server_addr() -> String {
    "localhost:8080".to_string()
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_download_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("./tls/server.crt")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("./tls/server.key")
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("./tls/server.crt")
}

fn default_handshake_timeout_secs() -> u64 {
    filemove_transport::DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    filemove_transport::DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_frame_format() -> String {
    FrameFormat::Delimited.as_str().to_string()
}

fn default_chunk_size() -> usize {
    filemove_core::DEFAULT_CHUNK_SIZE
}

fn default_store_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("filemove/users.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_root: default_storage_root(),
            max_connections: default_max_connections(),
            session_timeout_secs: default_session_timeout_secs(),
            enforce_session_identity: false,
            backlog: default_backlog(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            server_name: default_server_name(),
            download_root: default_download_root(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            ca_file: default_ca_file(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            frame_format: default_frame_format(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            store_file: default_store_file(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filemove/config.toml")
    }

    /// Load config from the default path, or create it with defaults
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", self.server.listen_addr, e))
    }

    /// Parse the frame format
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown format name.
    pub fn frame_format(&self) -> anyhow::Result<FrameFormat> {
        self.protocol
            .frame_format
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        validate_host_port(&self.client.server_addr, "Server address")?;

        if self.server.max_connections == 0 || self.server.max_connections > MAX_CONNECTIONS_LIMIT {
            anyhow::bail!(
                "Max connections must be between 1 and {}",
                MAX_CONNECTIONS_LIMIT
            );
        }

        if self.client.server_name.is_empty() {
            anyhow::bail!("Server name must not be empty");
        }

        self.frame_format()?;

        if self.protocol.chunk_size == 0 || self.protocol.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }

        if self.tls.handshake_timeout_secs == 0 || self.tls.connect_timeout_secs == 0 {
            anyhow::bail!("TLS handshake and connect timeouts must be non-zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    fn transfer_options(&self, base: TransferOptions) -> anyhow::Result<TransferOptions> {
        Ok(TransferOptions {
            format: self.frame_format()?,
            chunk_size: self.protocol.chunk_size,
            ..base
        })
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            handshake_timeout: Duration::from_secs(self.tls.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.tls.connect_timeout_secs),
            backlog: self.server.backlog,
            ..TransportConfig::default()
        }
    }

    /// Library configuration for `serve`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let config = ServerConfig {
            listen_addr: self.parse_listen_addr()?,
            storage_root: self.server.storage_root.clone(),
            admission: AdmissionConfig {
                max_connections: self.server.max_connections,
            },
            transfer: self.transfer_options(TransferOptions::server())?,
            transport: self.transport_config(),
            session_timeout: timeout(self.server.session_timeout_secs),
            enforce_session_identity: self.server.enforce_session_identity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Library configuration for `upload`, `download` and `shell`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let config = ClientConfig {
            server_addr: self.client.server_addr.clone(),
            server_name: Some(self.client.server_name.clone()),
            download_root: self.client.download_root.clone(),
            transfer: self.transfer_options(TransferOptions::client())?,
            transport: self.transport_config(),
            session_timeout: timeout(self.client.session_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;

    if port == 0 {
        anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
    }

    if host.is_empty() {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }

    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}
