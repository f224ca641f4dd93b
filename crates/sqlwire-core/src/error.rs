//! Error types for sqlwire operations.

use std::fmt;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout, TLS)
    Connection(ConnectionError),
    /// Malformed or unexpected packet structure, sequence mismatch
    Protocol(ProtocolError),
    /// The server greeting announced a protocol version other than 10
    UnsupportedProtocolVersion(u8),
    /// The server asked for an authentication plugin the client does not have
    UnsupportedAuthPlugin(String),
    /// The server rejected the credentials during the handshake
    Authentication(ServerError),
    /// An ERR packet returned in response to a command
    Server(ServerError),
    /// Column definitions or rows that do not decode consistently
    MalformedResultSet(String),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// DNS resolution failed
    DnsResolution,
    /// Connection lost during operation
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// The client asked for a feature the server does not advertise
    CapabilityMismatch,
    /// A read or write exceeded its deadline
    Timeout,
    /// The connection was closed, either explicitly or after an earlier failure
    Closed,
}

/// An error reported by the server in an ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a connection error that leaves the connection unusable?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Did the server report this error through an ERR packet?
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Authentication(e) | Error::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "42S02" for a missing table)
    pub fn sqlstate(&self) -> Option<&str> {
        self.server_error()
            .map(|e| e.sql_state.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Get the server error code if available.
    pub fn code(&self) -> Option<u16> {
        self.server_error().map(|e| e.code)
    }

    /// Is this a timeout on the underlying transport?
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Connection(c) => c.kind == ConnectionErrorKind::Timeout,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

impl ServerError {
    /// Check if this is a unique constraint violation (ER_DUP_ENTRY).
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// Check if this is an unknown table error (ER_NO_SUCH_TABLE).
    pub fn is_no_such_table(&self) -> bool {
        self.code == 1146
    }

    /// Check if this is an access denied error.
    pub fn is_access_denied(&self) -> bool {
        matches!(self.code, 1044 | 1045)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::UnsupportedProtocolVersion(v) => {
                write!(f, "Unsupported protocol version: {} (expected 10)", v)
            }
            Error::UnsupportedAuthPlugin(name) => {
                write!(f, "Unsupported authentication plugin: {}", name)
            }
            Error::Authentication(e) => write!(f, "Authentication failed: {}", e),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::MalformedResultSet(msg) => write!(f, "Malformed result set: {}", msg),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "{} ({})", self.message, self.code)
        } else {
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, self.sql_state)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_table() -> ServerError {
        ServerError {
            code: 1146,
            sql_state: "42S02".to_string(),
            message: "Table 'x.y' doesn't exist".to_string(),
        }
    }

    #[test]
    fn server_error_helpers() {
        let err = Error::Server(missing_table());
        assert_eq!(err.code(), Some(1146));
        assert_eq!(err.sqlstate(), Some("42S02"));
        assert!(err.server_error().unwrap().is_no_such_table());
        assert!(!err.is_connection_error());
    }

    #[test]
    fn empty_sqlstate_is_none() {
        let err = Error::Authentication(ServerError {
            code: 1045,
            sql_state: String::new(),
            message: "Access denied".to_string(),
        });
        assert_eq!(err.sqlstate(), None);
        assert!(err.server_error().unwrap().is_access_denied());
    }

    #[test]
    fn connection_flags() {
        let err = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Timeout,
            message: "read timed out".to_string(),
            source: None,
        });
        assert!(err.is_connection_error());
        assert!(err.is_timeout());

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(io.is_timeout());
        assert!(io.is_connection_error());

        let protocol = Error::Protocol(ProtocolError {
            message: "sequence mismatch".to_string(),
            raw_data: None,
            source: None,
        });
        assert!(protocol.is_connection_error());
    }

    #[test]
    fn display_formats() {
        let err = Error::Server(missing_table());
        assert_eq!(
            err.to_string(),
            "Server error: Table 'x.y' doesn't exist (1146, SQLSTATE 42S02)"
        );

        let err = Error::UnsupportedProtocolVersion(9);
        assert_eq!(
            err.to_string(),
            "Unsupported protocol version: 9 (expected 10)"
        );

        let err = Error::UnsupportedAuthPlugin("caching_sha2_password".to_string());
        assert!(err.to_string().contains("caching_sha2_password"));
    }

    #[test]
    fn io_error_has_source() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::other("boom"));
        assert!(err.source().is_some());
    }
}
