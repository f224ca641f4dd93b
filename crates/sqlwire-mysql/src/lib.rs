//! MySQL/MariaDB client protocol for sqlwire.
//!
//! This crate implements the client side of the MySQL wire protocol over
//! blocking `std::io` streams. It provides:
//!
//! - Packet framing with sequence numbers and 16MB splitting
//! - The connection handshake as an explicit state machine
//! - TLS upgrade via rustls (`tls` feature, on by default)
//! - The zlib compressed protocol
//! - `mysql_native_password` authentication, with a plugin trait
//! - Text queries with lazily decoded result sets
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection, QueryResult};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .password("secret")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! if let QueryResult::Rows(rows) = conn.query("SELECT id, name FROM users")? {
//!     for row in rows {
//!         let row = row?;
//!         println!("{:?}", row.get_str(1));
//!     }
//! }
//! conn.close()?;
//! ```

pub mod auth;
pub mod compression;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod protocol;
pub mod resultset;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::{AuthPlugin, NativePassword};
pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{ConnectionState, MySqlConnection};
pub use handshake::{HandshakeState, Session};
pub use protocol::{ErrPacket, OkPacket};
pub use resultset::{QueryOutcome, QueryResult, ResultSet, RowStream};
pub use sqlwire_core::{ColumnInfo, Error, Result, Row, ServerError};
pub use types::{ColumnDefinition, FieldType};
