//! MySQL connection configuration.
//!
//! Provides connection parameters for establishing MySQL connections
//! including authentication, TLS, compression and timeouts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthPlugin;
use crate::compression::DEFAULT_THRESHOLD;
use crate::protocol::charset;

/// SSL mode for MySQL connections.
///
/// There is no "preferred" mode: a connection that asks for TLS either
/// gets it or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Require SSL; fail if the server does not offer it
    Required,
}

impl SslMode {
    /// Check if SSL is requested.
    pub const fn is_required(self) -> bool {
        matches!(self, SslMode::Required)
    }
}

/// TLS settings used when `SslMode::Required` is selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM bundle of trusted CAs; the webpki roots are used when unset
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// PEM private key matching `client_cert_path`
    pub client_key_path: Option<PathBuf>,
    /// Name sent for SNI and checked against the certificate, if not the host
    pub server_name: Option<String>,
    /// Accept any server certificate. Never enabled by default.
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    /// Create a TLS configuration that verifies against the webpki roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the CAs in this PEM file instead of the webpki roots.
    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Present this client certificate.
    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    /// Private key for the client certificate.
    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    /// Override the server name used for SNI and verification.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Disable certificate verification.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// MySQL connection configuration.
#[derive(Clone)]
pub struct MySqlConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database name to connect to (optional at connect time)
    pub database: Option<String>,
    /// Character set (default: utf8mb4)
    pub charset: u8,
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Read/write timeout on the socket; `None` blocks indefinitely
    pub io_timeout: Option<Duration>,
    /// SSL mode
    pub ssl_mode: SslMode,
    /// TLS settings, used when `ssl_mode` requires TLS
    pub tls_config: TlsConfig,
    /// Enable compression (CLIENT_COMPRESS capability)
    pub compression: bool,
    /// Frame bodies up to this many bytes are sent uncompressed
    pub compression_threshold: usize,
    /// Max packet size announced to the server
    pub max_packet_size: u32,
    /// Extra authentication plugins, consulted before the built-in one
    pub auth_plugins: Vec<Arc<dyn AuthPlugin>>,
}

impl std::fmt::Debug for MySqlConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .field("ssl_mode", &self.ssl_mode)
            .field("tls_config", &self.tls_config)
            .field("compression", &self.compression)
            .field("compression_threshold", &self.compression_threshold)
            .field("max_packet_size", &self.max_packet_size)
            .field("auth_plugins", &self.auth_plugins)
            .finish()
    }
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            io_timeout: Some(Duration::from_secs(30)),
            ssl_mode: SslMode::default(),
            tls_config: TlsConfig::default(),
            compression: false,
            compression_threshold: DEFAULT_THRESHOLD,
            max_packet_size: 0xFF_FF_FF,
            auth_plugins: Vec::new(),
        }
    }
}

impl MySqlConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the character set.
    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the socket read/write timeout.
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the SSL mode.
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Set the TLS settings.
    pub fn tls_config(mut self, tls_config: TlsConfig) -> Self {
        self.tls_config = tls_config;
        self
    }

    /// Enable or disable compression.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Set the size above which frame bodies are compressed.
    pub fn compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Set the max packet size announced to the server.
    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Register an additional authentication plugin.
    pub fn auth_plugin(mut self, plugin: Arc<dyn AuthPlugin>) -> Self {
        self.auth_plugins.push(plugin);
        self
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build capability flags based on configuration.
    pub fn capability_flags(&self) -> u32 {
        use crate::protocol::capabilities::{
            CLIENT_COMPRESS, CLIENT_CONNECT_WITH_DB, CLIENT_SSL, DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS;

        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }

        if self.ssl_mode.is_required() {
            flags |= CLIENT_SSL;
        }

        if self.compression {
            flags |= CLIENT_COMPRESS;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NativePassword;

    #[test]
    fn test_config_builder() {
        let config = MySqlConfig::new()
            .host("db.example.com")
            .port(3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .connect_timeout(Duration::from_secs(10))
            .io_timeout(None)
            .ssl_mode(SslMode::Required)
            .tls_config(TlsConfig::new().ca_cert("/etc/ssl/ca.pem"))
            .compression(true)
            .compression_threshold(0)
            .auth_plugin(Arc::new(NativePassword));

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 3307);
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password, Some("secret".to_string()));
        assert_eq!(config.database, Some("testdb".to_string()));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.io_timeout, None);
        assert_eq!(config.ssl_mode, SslMode::Required);
        assert_eq!(
            config.tls_config.ca_cert_path,
            Some(PathBuf::from("/etc/ssl/ca.pem"))
        );
        assert!(config.compression);
        assert_eq!(config.compression_threshold, 0);
        assert_eq!(config.auth_plugins.len(), 1);
    }

    #[test]
    fn test_socket_addr() {
        let config = MySqlConfig::new().host("db.example.com").port(3307);
        assert_eq!(config.socket_addr(), "db.example.com:3307");
    }

    #[test]
    fn test_capability_flags() {
        use crate::protocol::capabilities::*;

        let flags = MySqlConfig::new().capability_flags();
        assert!(flags & CLIENT_PROTOCOL_41 != 0);
        assert!(flags & CLIENT_SECURE_CONNECTION != 0);
        assert!(flags & CLIENT_DEPRECATE_EOF != 0);
        assert!(flags & CLIENT_CONNECT_WITH_DB == 0);
        assert!(flags & CLIENT_SSL == 0);
        assert!(flags & CLIENT_COMPRESS == 0);
        assert!(flags & CLIENT_LOCAL_FILES == 0);

        let flags = MySqlConfig::new()
            .database("test")
            .compression(true)
            .ssl_mode(SslMode::Required)
            .capability_flags();
        assert!(flags & CLIENT_CONNECT_WITH_DB != 0);
        assert!(flags & CLIENT_COMPRESS != 0);
        assert!(flags & CLIENT_SSL != 0);
    }

    #[test]
    fn test_default_config() {
        let config = MySqlConfig::default();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.ssl_mode, SslMode::Disable);
        assert!(!config.tls_config.danger_skip_verify);
        assert!(!config.compression);
        assert_eq!(config.compression_threshold, 50);
        assert_eq!(config.charset, charset::UTF8MB4_GENERAL_CI);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = MySqlConfig::new().password("hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
