//! MySQL connection implementation.
//!
//! This module ties the transport, handshake and command layers into the
//! connection lifecycle:
//!
//! ```text
//! Connecting ──► Authenticating ──► Ready ◄──► Querying
//!      │               │              │           │
//!      └───────────────┴──────────────┴───────────┴──► Closed
//! ```
//!
//! Any error once the connection has been opened, including an ERR packet
//! returned for a query, drops the stream and leaves the connection
//! `Closed`. A connection is never reused after its position in the byte
//! stream became uncertain.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};
use sqlwire_core::{Error, Result};

use crate::config::MySqlConfig;
use crate::handshake::{Handshake, Session};
use crate::protocol::{Command, OkPacket, PacketReader, ServerPacket, capabilities, server_status};
use crate::resultset::{QueryOutcome, QueryResult, RowStream, parse_column_definition};
use crate::tls;
use crate::transport::PacketTransport;
use crate::types::ColumnDefinition;

/// Connection state in the MySQL protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream established, awaiting the server greeting
    Connecting,
    /// Performing the authentication handshake
    Authenticating,
    /// Ready for commands
    Ready,
    /// A command is in flight or its result set is being read
    Querying,
    /// The stream has been dropped
    Closed,
}

/// A MySQL connection speaking the text protocol.
///
/// Generic over the stream so the client can run over anything that reads
/// and writes bytes; [`MySqlConnection::connect`] opens a TCP stream.
pub struct MySqlConnection<S: Read + Write = TcpStream> {
    transport: PacketTransport<S>,
    state: ConnectionState,
    session: Option<Session>,
    config: MySqlConfig,
    status_flags: u16,
    warnings: u16,
}

impl<S: Read + Write> std::fmt::Debug for MySqlConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection<TcpStream> {
    /// Establish a new connection to the MySQL server.
    ///
    /// This performs the complete connection sequence:
    /// 1. DNS resolution and TCP connect (bounded by `connect_timeout`)
    /// 2. Server greeting and capability negotiation
    /// 3. TLS upgrade, if required
    /// 4. Authentication, following any auth switch
    /// 5. Compression, if negotiated
    #[tracing::instrument(level = "debug", skip_all, fields(addr = %config.socket_addr()))]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let stream = open_tcp(&config)?;
        Self::connect_with_stream(stream, config)
    }
}

impl<S: Read + Write> MySqlConnection<S> {
    /// Run the handshake over an already connected stream.
    pub fn connect_with_stream(stream: S, config: MySqlConfig) -> Result<Self> {
        if config.ssl_mode.is_required() {
            tls::validate_tls_config(&config.tls_config)?;
        }

        let mut conn = Self {
            transport: PacketTransport::new(stream),
            state: ConnectionState::Connecting,
            session: None,
            config,
            status_flags: 0,
            warnings: 0,
        };

        conn.set_state(ConnectionState::Authenticating);
        let handshake = Handshake::new(&conn.config).run(&mut conn.transport);
        let session = match handshake {
            Ok(session) => session,
            Err(e) => return Err(conn.fail(e)),
        };

        if capabilities::has(session.capabilities, capabilities::CLIENT_COMPRESS) {
            let threshold = conn.config.compression_threshold;
            if let Err(e) = conn.transport.enable_compression(threshold) {
                return Err(conn.fail(e));
            }
        }

        tracing::debug!(
            connection_id = session.greeting.connection_id,
            server_version = %session.greeting.server_version,
            tls = conn.transport.is_tls(),
            compressed = conn.transport.is_compressed(),
            "Connection established"
        );

        conn.status_flags = session.status_flags;
        conn.session = Some(session);
        conn.set_state(ConnectionState::Ready);
        Ok(conn)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection is ready for commands.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Get the parameters settled by the handshake.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Get the configuration this connection was opened with.
    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Get the connection ID.
    pub fn connection_id(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(0, |s| s.greeting.connection_id)
    }

    /// Get the server version.
    pub fn server_version(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|s| s.greeting.server_version.as_str())
    }

    /// Get the negotiated capability flags.
    pub fn capabilities(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.capabilities)
    }

    /// Get the server status flags from the last OK or EOF packet.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    /// Get the warning count from the last OK or EOF packet.
    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Check whether the server reports an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    /// Check whether the stream is encrypted.
    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Check whether the compressed protocol is active.
    pub fn is_compressed(&self) -> bool {
        self.transport.is_compressed()
    }

    /// Execute a text protocol query.
    ///
    /// The SQL is sent as-is: there is no escaping and no parameter binding.
    /// A result set is returned as a [`RowStream`] borrowing the connection.
    #[tracing::instrument(level = "debug", skip_all, fields(sql_len = sql.len()))]
    pub fn query(&mut self, sql: &str) -> Result<QueryResult<'_, S>> {
        let mut command = Vec::with_capacity(sql.len() + 1);
        command.push(Command::Query as u8);
        command.extend_from_slice(sql.as_bytes());
        self.send_command(&command)?;

        let payload = self.read_packet()?;
        let packet = match ServerPacket::command_response(&payload, self.capabilities()) {
            Ok(packet) => packet,
            Err(message) => return Err(self.fail(protocol_error_raw(message, &payload))),
        };

        match packet {
            ServerPacket::Ok(ok) => {
                tracing::debug!(affected_rows = ok.affected_rows, "Query acknowledged");
                self.finish_command(ok.status_flags, ok.warnings);
                Ok(QueryResult::Ok(ok))
            }
            ServerPacket::Err(err) => Err(self.fail(Error::Server(err.into()))),
            ServerPacket::LocalInfile(file) => Err(self.fail(protocol_error(format!(
                "Server requested LOCAL INFILE '{}' but local files are not enabled",
                file
            )))),
            ServerPacket::Eof(_) => Err(self.fail(protocol_error_raw(
                "Unexpected EOF packet in response to a query",
                &payload,
            ))),
            ServerPacket::Data(data) => {
                let column_count = PacketReader::new(data)
                    .read_lenenc_int()
                    .and_then(|n| usize::try_from(n).ok());
                let Some(column_count) = column_count else {
                    return Err(self.fail(protocol_error_raw("Invalid column count", &payload)));
                };
                tracing::debug!(columns = column_count, "Reading result set");
                let columns = self.read_columns(column_count)?;
                Ok(QueryResult::Rows(RowStream::new(self, columns)))
            }
        }
    }

    /// Execute a query and read the whole response.
    pub fn query_all(&mut self, sql: &str) -> Result<QueryOutcome> {
        self.query(sql)?.into_outcome()
    }

    /// Ping the server (COM_PING).
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn ping(&mut self) -> Result<()> {
        self.send_command(&[Command::Ping as u8])?;
        self.expect_ok().map(|_| ())
    }

    /// Reset session state without re-authenticating (COM_RESET_CONNECTION).
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn reset(&mut self) -> Result<()> {
        self.send_command(&[Command::ResetConnection as u8])?;
        self.expect_ok().map(|_| ())
    }

    /// Close the connection.
    ///
    /// COM_QUIT is sent if the connection is still open; the stream is
    /// dropped either way. A failure to send the command is returned.
    pub fn close(mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        self.transport.reset_sequence();
        let sent = self.transport.send_packet(&[Command::Quit as u8]);
        self.transport.detach();
        self.set_state(ConnectionState::Closed);
        sent
    }

    /// Receive one packet, closing the connection on failure.
    pub(crate) fn read_packet(&mut self) -> Result<Vec<u8>> {
        match self.transport.receive_packet() {
            Ok(payload) => Ok(payload),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Record the status carried by a command's final packet.
    pub(crate) fn finish_command(&mut self, status_flags: u16, warnings: u16) {
        self.status_flags = status_flags;
        self.warnings = warnings;
        self.set_state(ConnectionState::Ready);
    }

    /// Drop the stream and mark the connection closed, returning `err`.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if self.state != ConnectionState::Closed {
            tracing::debug!(state = ?self.state, error = %err, "Closing connection after error");
            self.transport.detach();
            self.set_state(ConnectionState::Closed);
        }
        err
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "Connection state");
            self.state = next;
        }
    }

    fn send_command(&mut self, payload: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::Closed => {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Closed,
                    message: "Connection is closed".to_string(),
                    source: None,
                }));
            }
            other => {
                return Err(protocol_error(format!(
                    "Connection is not ready for commands (state {:?})",
                    other
                )));
            }
        }

        self.set_state(ConnectionState::Querying);
        self.transport.reset_sequence();
        match self.transport.send_packet(payload) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn expect_ok(&mut self) -> Result<OkPacket> {
        let payload = self.read_packet()?;
        match ServerPacket::command_response(&payload, self.capabilities()) {
            Ok(ServerPacket::Ok(ok)) => {
                self.finish_command(ok.status_flags, ok.warnings);
                Ok(ok)
            }
            Ok(ServerPacket::Err(err)) => Err(self.fail(Error::Server(err.into()))),
            Ok(_) => Err(self.fail(protocol_error_raw("Expected an OK packet", &payload))),
            Err(message) => Err(self.fail(protocol_error_raw(message, &payload))),
        }
    }

    fn read_columns(&mut self, column_count: usize) -> Result<Vec<ColumnDefinition>> {
        let mut columns = Vec::with_capacity(column_count.min(1024));
        for _ in 0..column_count {
            let payload = self.read_packet()?;
            match parse_column_definition(&payload) {
                Ok(column) => columns.push(column),
                Err(e) => return Err(self.fail(e)),
            }
        }

        if !capabilities::has(self.capabilities(), capabilities::CLIENT_DEPRECATE_EOF) {
            let payload = self.read_packet()?;
            match ServerPacket::result_row(&payload, self.capabilities()) {
                Ok(ServerPacket::Eof(_)) => {}
                Ok(ServerPacket::Err(err)) => return Err(self.fail(Error::Server(err.into()))),
                _ => {
                    return Err(self.fail(protocol_error_raw(
                        "Expected EOF after column definitions",
                        &payload,
                    )));
                }
            }
        }

        Ok(columns)
    }
}

/// Resolve the configured host and connect to the first address that answers.
fn open_tcp(config: &MySqlConfig) -> Result<TcpStream> {
    let addr = config.socket_addr();
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| {
            connection_error(
                ConnectionErrorKind::DnsResolution,
                format!("Failed to resolve {}: {}", addr, e),
                Some(e),
            )
        })?
        .collect();

    if addrs.is_empty() {
        return Err(connection_error(
            ConnectionErrorKind::DnsResolution,
            format!("No addresses found for {}", addr),
            None,
        ));
    }

    let mut last_err = None;
    for candidate in &addrs {
        match TcpStream::connect_timeout(candidate, config.connect_timeout) {
            Ok(stream) => {
                tracing::debug!(addr = %candidate, "TCP connected");
                configure_socket(&stream, config)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(addr = %candidate, error = %e, "TCP connect failed");
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| std::io::Error::other("no address attempted"));
    let kind = match err.kind() {
        std::io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            ConnectionErrorKind::Timeout
        }
        _ => ConnectionErrorKind::Connect,
    };
    Err(connection_error(
        kind,
        format!("Failed to connect to {}: {}", addr, err),
        Some(err),
    ))
}

fn configure_socket(stream: &TcpStream, config: &MySqlConfig) -> Result<()> {
    let socket_error = |e: std::io::Error| {
        connection_error(
            ConnectionErrorKind::Connect,
            format!("Failed to configure socket: {}", e),
            Some(e),
        )
    };
    stream.set_nodelay(true).map_err(socket_error)?;
    stream
        .set_read_timeout(config.io_timeout)
        .map_err(socket_error)?;
    stream
        .set_write_timeout(config.io_timeout)
        .map_err(socket_error)?;
    Ok(())
}

fn connection_error(
    kind: ConnectionErrorKind,
    message: String,
    source: Option<std::io::Error>,
) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message,
        source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

fn protocol_error_raw(msg: impl Into<String>, raw: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: Some(raw.to_vec()),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SslMode, TlsConfig};
    use crate::protocol::{PacketWriter, frame_payload};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    const SERVER_CAPS: u32 = capabilities::CLIENT_LONG_PASSWORD
        | capabilities::CLIENT_PROTOCOL_41
        | capabilities::CLIENT_TRANSACTIONS
        | capabilities::CLIENT_SECURE_CONNECTION
        | capabilities::CLIENT_PLUGIN_AUTH
        | capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | capabilities::CLIENT_DEPRECATE_EOF;

    /// Replays a fixed server script and records what the client wrote.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn greeting() -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("10.11.6-MariaDB");
        w.write_u32_le(7);
        w.write_bytes(b"abcdefgh");
        w.write_u8(0);
        w.write_u16_le((SERVER_CAPS & 0xFFFF) as u16);
        w.write_u8(45);
        w.write_u16_le(0x0002);
        w.write_u16_le((SERVER_CAPS >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(b"ijklmnopqrst");
        w.write_u8(0);
        w.write_null_string("mysql_native_password");
        w.into_bytes()
    }

    fn ok(status: u16) -> Vec<u8> {
        let [lo, hi] = status.to_le_bytes();
        vec![0x00, 0x00, 0x00, lo, hi, 0x00, 0x00]
    }

    fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut seq = seq;
        frame_payload(payload, &mut seq)
    }

    fn open(after_auth: &[Vec<u8>]) -> (MySqlConnection<Scripted>, Arc<Mutex<Vec<u8>>>) {
        let mut script = packet(0, &greeting());
        script.extend(packet(2, &ok(0x0002)));
        for chunk in after_auth {
            script.extend_from_slice(chunk);
        }
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = Scripted {
            input: Cursor::new(script),
            written: Arc::clone(&written),
        };
        let config = MySqlConfig::new().user("root").password("secret");
        let conn = MySqlConnection::connect_with_stream(stream, config).unwrap();
        (conn, written)
    }

    #[test]
    fn test_connect_reaches_ready() {
        let (conn, _) = open(&[]);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.connection_id(), 7);
        assert_eq!(conn.server_version(), Some("10.11.6-MariaDB"));
        assert_eq!(conn.status_flags(), 0x0002);
        assert!(!conn.in_transaction());
        assert!(!conn.is_tls());
        assert!(!conn.is_compressed());
    }

    #[test]
    fn test_query_ok_packet() {
        let (mut conn, written) = open(&[packet(1, &[0x00, 0x03, 0x09, 0x03, 0x00, 0x01, 0x00])]);
        let before = written.lock().unwrap().len();

        match conn.query("UPDATE t SET x = 1").unwrap() {
            QueryResult::Ok(ok) => {
                assert_eq!(ok.affected_rows, 3);
                assert_eq!(ok.last_insert_id, 9);
            }
            QueryResult::Rows(_) => panic!("expected OK"),
        }
        assert!(conn.is_ready());
        assert!(conn.in_transaction());
        assert_eq!(conn.warnings(), 1);

        let sent = written.lock().unwrap()[before..].to_vec();
        let mut expected = vec![19, 0, 0, 0, 0x03];
        expected.extend_from_slice(b"UPDATE t SET x = 1");
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_query_result_debug_with_plain_stream() {
        let (mut conn, _) = open(&[packet(1, &ok(0x0002))]);
        let result = conn.query("DO 1").unwrap();
        let rendered = format!("{result:?}");
        assert!(rendered.starts_with("Ok(OkPacket"));
    }

    #[test]
    fn test_local_infile_is_rejected() {
        let (mut conn, _) = open(&[packet(1, b"\xFBdata.csv")]);
        let err = conn.query("LOAD DATA LOCAL INFILE 'data.csv' INTO TABLE t").unwrap_err();
        assert!(matches!(err, Error::Protocol(ref e) if e.message.contains("data.csv")));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_closed_connection_rejects_commands() {
        let mut err = vec![0xFF, 0x7A, 0x04, b'#'];
        err.extend_from_slice(b"42S02Table 't' doesn't exist");
        let (mut conn, _) = open(&[packet(1, &err)]);
        assert!(matches!(conn.ping(), Err(Error::Server(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);

        match conn.query("SELECT 1") {
            Err(Error::Connection(e)) => assert_eq!(e.kind, ConnectionErrorKind::Closed),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_close_sends_quit() {
        let (conn, written) = open(&[]);
        let before = written.lock().unwrap().len();
        conn.close().unwrap();
        assert_eq!(&written.lock().unwrap()[before..], &[1, 0, 0, 0, 0x01]);
    }

    #[test]
    fn test_half_configured_client_cert_is_config_error() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = Scripted {
            input: Cursor::new(packet(0, &greeting())),
            written: Arc::clone(&written),
        };
        let config = MySqlConfig::new()
            .user("root")
            .ssl_mode(SslMode::Required)
            .tls_config(TlsConfig::new().client_cert("/etc/mysql/client.pem"));

        match MySqlConnection::connect_with_stream(stream, config) {
            Err(Error::Config(e)) => assert!(e.message.contains("client key")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_auth_failure_is_reported() {
        let mut script = packet(0, &greeting());
        let mut err = vec![0xFF, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000Access denied for user 'root'@'localhost'");
        script.extend(packet(2, &err));

        let stream = Scripted {
            input: Cursor::new(script),
            written: Arc::new(Mutex::new(Vec::new())),
        };
        let config = MySqlConfig::new().user("root").password("wrong");
        match MySqlConnection::connect_with_stream(stream, config) {
            Err(Error::Authentication(e)) => assert!(e.is_access_denied()),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
