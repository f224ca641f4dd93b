//! Connection handshake.
//!
//! The handshake is an explicit state machine:
//!
//! ```text
//! AwaitingGreeting ──► CapabilitiesSent ──► AwaitingTlsAck ──┐   (TLS only)
//!        │                                                    ▼
//!        └────────────────────────────────────────────────► AuthSent
//!                                                             │
//!                           AuthSwitch ◄── AwaitingAuthResult ◄┘
//!                               │               │
//!                               └──► AuthSent   └──► Ready | Failed
//! ```
//!
//! `Ready` and `Failed` are absorbing. Any error moves the machine to
//! `Failed` and is returned to the caller, who must drop the stream.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};
use std::sync::Arc;

use serde::Serialize;
use sqlwire_core::Error;
use sqlwire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};

use crate::auth::{self, AuthPlugin, NativePassword};
use crate::config::MySqlConfig;
use crate::protocol::{OkPacket, PacketReader, PacketWriter, capabilities};
use crate::tls;
use crate::transport::PacketTransport;

/// The only protocol version this client speaks.
pub const PROTOCOL_VERSION: u8 = 10;

/// States of the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the server greeting
    AwaitingGreeting,
    /// SSL request sent, TLS handshake about to start
    CapabilitiesSent,
    /// TLS handshake in progress
    AwaitingTlsAck,
    /// Handshake response or auth data written
    AuthSent,
    /// Waiting for OK, ERR or an auth switch request
    AwaitingAuthResult,
    /// Server asked for a different plugin
    AuthSwitch,
    /// Authenticated
    Ready,
    /// The handshake failed
    Failed,
}

/// Initial handshake packet (protocol version 10) sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Greeting {
    /// Protocol version, always 10
    pub protocol_version: u8,
    /// Server version string
    pub server_version: String,
    /// Connection (thread) ID
    pub connection_id: u32,
    /// Auth plugin data: 8 bytes + up to 12 more, trailing NUL removed
    pub scramble: Vec<u8>,
    /// Server capability flags
    pub capabilities: u32,
    /// Server default character set
    pub charset: u8,
    /// Server status flags
    pub status_flags: u16,
    /// Auth plugin the scramble is meant for (empty before PLUGIN_AUTH)
    pub auth_plugin: String,
}

impl Greeting {
    /// Parse the greeting payload.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| protocol_error("Empty server greeting"))?;

        if protocol_version == 0xFF {
            // Rejected before the handshake started (host blocked, too many connections)
            let err = PacketReader::new(payload)
                .parse_err_packet()
                .ok_or_else(|| protocol_error("Invalid error packet in greeting"))?;
            return Err(Error::Server(err.into()));
        }
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedProtocolVersion(protocol_version));
        }

        let server_version = reader
            .read_null_string()
            .ok_or_else(|| protocol_error("Missing server version"))?;
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| protocol_error("Missing connection ID"))?;
        let scramble_1 = reader
            .read_bytes(8)
            .ok_or_else(|| protocol_error("Missing auth data"))?;

        // Filler
        reader.skip(1);

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| protocol_error("Missing capability flags"))?;

        // Everything past the lower capability flags is optional
        let charset = reader.read_u8().unwrap_or_default();
        let status_flags = reader.read_u16_le().unwrap_or_default();
        let caps_upper = reader.read_u16_le().unwrap_or_default();
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = usize::from(reader.read_u8().unwrap_or_default());
        reader.skip(10);

        let mut scramble = scramble_1.to_vec();
        if capabilities::has(capabilities, capabilities::CLIENT_SECURE_CONNECTION) {
            let len = auth_data_len.saturating_sub(8).max(13).min(reader.remaining());
            let part2 = reader.read_bytes(len).unwrap_or_default();
            scramble.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
        }

        let auth_plugin = if capabilities::has(capabilities, capabilities::CLIENT_PLUGIN_AUTH) {
            reader.read_null_string().unwrap_or_default()
        } else {
            String::new()
        };

        Ok(Greeting {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// Auth switch request (0xFE during authentication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    /// Plugin the server wants the client to use
    pub plugin: String,
    /// Fresh scramble for that plugin
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Parse an auth switch request, including its 0xFE marker.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() == 1 {
            // Bare 0xFE: pre-4.1 "old password" switch
            return Err(Error::UnsupportedAuthPlugin("mysql_old_password".to_string()));
        }
        let mut reader = PacketReader::new(payload.get(1..).unwrap_or_default());
        let plugin = reader
            .read_null_string()
            .ok_or_else(|| protocol_error("Missing plugin name in auth switch"))?;
        let rest = reader.read_rest();
        let scramble = rest.strip_suffix(&[0]).unwrap_or(rest).to_vec();
        Ok(Self { plugin, scramble })
    }
}

/// What the server said after an auth response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Authenticated
    Ok(OkPacket),
    /// Authenticate again with another plugin
    Switch(AuthSwitchRequest),
}

impl AuthResult {
    /// Classify an auth result packet.
    pub fn parse(payload: &[u8], capabilities: u32) -> Result<Self, Error> {
        match payload.first() {
            Some(0x00) => PacketReader::new(payload)
                .parse_ok_packet(capabilities)
                .map(AuthResult::Ok)
                .ok_or_else(|| protocol_error("Invalid OK packet after authentication")),
            Some(0xFF) => {
                let err = PacketReader::new(payload)
                    .parse_err_packet()
                    .ok_or_else(|| protocol_error("Invalid error packet"))?;
                Err(Error::Authentication(err.into()))
            }
            Some(0xFE) => AuthSwitchRequest::parse(payload).map(AuthResult::Switch),
            Some(0x01) => Err(protocol_error_raw(
                "Unexpected extra auth data from server",
                payload,
            )),
            Some(b) => Err(protocol_error_raw(
                format!("Unexpected auth result packet: 0x{:02X}", b),
                payload,
            )),
            None => Err(protocol_error("Empty auth result packet")),
        }
    }
}

/// Fields of the HandshakeResponse41 packet.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
}

impl HandshakeResponse<'_> {
    /// Encode the response payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.write_u32_le(self.capabilities);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.charset);
        writer.write_zeros(23);
        writer.write_null_string(self.user);

        if capabilities::has(
            self.capabilities,
            capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
        ) {
            writer.write_lenenc_bytes(self.auth_response);
        } else {
            // Auth responses are always < 256 bytes
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        }

        if capabilities::has(self.capabilities, capabilities::CLIENT_CONNECT_WITH_DB) {
            writer.write_null_string(self.database.unwrap_or_default());
        }

        if capabilities::has(self.capabilities, capabilities::CLIENT_PLUGIN_AUTH) {
            writer.write_null_string(self.auth_plugin);
        }

        writer.into_bytes()
    }
}

/// Parameters settled by a successful handshake.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// The server greeting
    pub greeting: Greeting,
    /// Negotiated capability flags (client request ∩ server offer)
    pub capabilities: u32,
    /// Server status after authentication
    pub status_flags: u16,
    /// Plugin that completed authentication
    pub auth_plugin: String,
}

/// Compute negotiated capabilities, failing on anything requested but not offered.
pub fn negotiate(client: u32, server: u32) -> Result<u32, Error> {
    if !capabilities::has(server, capabilities::CLIENT_PROTOCOL_41) {
        return Err(protocol_error("Server does not support protocol 4.1"));
    }

    for (flag, what) in [
        (capabilities::CLIENT_SSL, "TLS"),
        (capabilities::CLIENT_COMPRESS, "compression"),
        (capabilities::CLIENT_CONNECT_WITH_DB, "selecting a database at connect time"),
    ] {
        if capabilities::has(client, flag) && !capabilities::has(server, flag) {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::CapabilityMismatch,
                message: format!("{} was requested but the server does not support it", what),
                source: None,
            }));
        }
    }

    Ok(client & server)
}

/// Drives the handshake over a transport.
pub(crate) struct Handshake<'a> {
    config: &'a MySqlConfig,
    state: HandshakeState,
    greeting: Option<Greeting>,
    capabilities: u32,
    plugin: Option<Arc<dyn AuthPlugin>>,
    pending_switch: Option<AuthSwitchRequest>,
    status_flags: u16,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(config: &'a MySqlConfig) -> Self {
        Self {
            config,
            state: HandshakeState::AwaitingGreeting,
            greeting: None,
            capabilities: 0,
            plugin: None,
            pending_switch: None,
            status_flags: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the state machine to completion.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %self.config.user))]
    pub(crate) fn run<S: Read + Write>(
        &mut self,
        transport: &mut PacketTransport<S>,
    ) -> Result<Session, Error> {
        loop {
            match self.step(transport) {
                Ok(None) => {}
                Ok(Some(session)) => return Ok(session),
                Err(e) => {
                    tracing::debug!(state = ?self.state, error = %e, "Handshake failed");
                    self.transition(HandshakeState::Failed);
                    return Err(e);
                }
            }
        }
    }

    fn transition(&mut self, next: HandshakeState) {
        tracing::trace!(from = ?self.state, to = ?next, "Handshake transition");
        self.state = next;
    }

    fn step<S: Read + Write>(
        &mut self,
        transport: &mut PacketTransport<S>,
    ) -> Result<Option<Session>, Error> {
        match self.state {
            HandshakeState::AwaitingGreeting => {
                let payload = transport.receive_packet()?;
                let greeting = Greeting::parse(&payload)?;
                tracing::debug!(
                    server_version = %greeting.server_version,
                    connection_id = greeting.connection_id,
                    plugin = %greeting.auth_plugin,
                    "Received server greeting"
                );

                self.capabilities =
                    negotiate(self.config.capability_flags(), greeting.capabilities)?;
                self.greeting = Some(greeting);

                if capabilities::has(self.capabilities, capabilities::CLIENT_SSL) {
                    let request = tls::build_ssl_request(
                        self.capabilities,
                        self.config.max_packet_size,
                        self.config.charset,
                    );
                    transport.send_packet(&request)?;
                    self.transition(HandshakeState::CapabilitiesSent);
                } else {
                    self.send_response(transport)?;
                }
                Ok(None)
            }
            HandshakeState::CapabilitiesSent => {
                self.transition(HandshakeState::AwaitingTlsAck);
                Ok(None)
            }
            HandshakeState::AwaitingTlsAck => {
                self.upgrade_tls(transport)?;
                self.send_response(transport)?;
                Ok(None)
            }
            HandshakeState::AuthSent => {
                self.transition(HandshakeState::AwaitingAuthResult);
                Ok(None)
            }
            HandshakeState::AwaitingAuthResult => {
                let payload = transport.receive_packet()?;
                match AuthResult::parse(&payload, self.capabilities)? {
                    AuthResult::Ok(ok) => {
                        self.status_flags = ok.status_flags;
                        self.transition(HandshakeState::Ready);
                        self.session().map(Some)
                    }
                    AuthResult::Switch(request) => {
                        tracing::debug!(plugin = %request.plugin, "Server requested auth switch");
                        self.pending_switch = Some(request);
                        self.transition(HandshakeState::AuthSwitch);
                        Ok(None)
                    }
                }
            }
            HandshakeState::AuthSwitch => {
                let request = self
                    .pending_switch
                    .take()
                    .ok_or_else(|| protocol_error("Auth switch without a request"))?;
                let plugin = auth::resolve(&request.plugin, &self.config.auth_plugins)?;
                let response = plugin.scramble(self.password(), &request.scramble)?;
                self.plugin = Some(plugin);
                transport.send_packet(&response)?;
                self.transition(HandshakeState::AuthSent);
                Ok(None)
            }
            HandshakeState::Ready => self.session().map(Some),
            HandshakeState::Failed => Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                message: "Handshake already failed".to_string(),
                source: None,
            })),
        }
    }

    #[cfg(feature = "tls")]
    fn upgrade_tls<S: Read + Write>(&mut self, transport: &mut PacketTransport<S>) -> Result<(), Error> {
        tracing::debug!(host = %self.config.host, "Upgrading connection to TLS");
        transport.upgrade_tls(&self.config.tls_config, &self.config.host)
    }

    #[cfg(not(feature = "tls"))]
    fn upgrade_tls<S: Read + Write>(&mut self, _transport: &mut PacketTransport<S>) -> Result<(), Error> {
        Err(tls::tls_error(
            "TLS support requires the 'tls' feature of sqlwire-mysql",
        ))
    }

    fn send_response<S: Read + Write>(
        &mut self,
        transport: &mut PacketTransport<S>,
    ) -> Result<(), Error> {
        let greeting = self
            .greeting
            .as_ref()
            .ok_or_else(|| protocol_error("No server greeting received"))?;

        // A plugin we do not know is answered with native password; the
        // server follows up with a switch request if it disagrees.
        let plugin = auth::resolve(&greeting.auth_plugin, &self.config.auth_plugins)
            .unwrap_or_else(|_| Arc::new(NativePassword));
        let auth_response = plugin.scramble(self.password(), &greeting.scramble)?;

        let payload = HandshakeResponse {
            capabilities: self.capabilities,
            max_packet_size: self.config.max_packet_size,
            charset: self.config.charset,
            user: &self.config.user,
            auth_response: &auth_response,
            database: self.config.database.as_deref(),
            auth_plugin: plugin.name(),
        }
        .encode();

        transport.send_packet(&payload)?;
        self.plugin = Some(plugin);
        self.transition(HandshakeState::AuthSent);
        Ok(())
    }

    fn password(&self) -> &str {
        self.config.password.as_deref().unwrap_or_default()
    }

    fn session(&self) -> Result<Session, Error> {
        let greeting = self
            .greeting
            .clone()
            .ok_or_else(|| protocol_error("No server greeting received"))?;
        Ok(Session {
            greeting,
            capabilities: self.capabilities,
            status_flags: self.status_flags,
            auth_plugin: self
                .plugin
                .as_ref()
                .map(|p| p.name().to_string())
                .unwrap_or_default(),
        })
    }
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
    use crate::protocol::capabilities::*;
    use std::io::Cursor;

    const SERVER_CAPS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF;

    fn scramble() -> Vec<u8> {
        (1..=20).collect()
    }

    fn greeting_payload(caps: u32, plugin: &str) -> Vec<u8> {
        let scramble = scramble();
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36");
        w.write_u32_le(42);
        w.write_bytes(&scramble[..8]);
        w.write_u8(0);
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(45);
        w.write_u16_le(0x0002);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&scramble[8..]);
        w.write_u8(0);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut seq = seq;
        crate::protocol::frame_payload(payload, &mut seq)
    }

    #[derive(Debug)]
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn transport(script: Vec<u8>) -> PacketTransport<Duplex> {
        PacketTransport::new(Duplex {
            input: Cursor::new(script),
            output: Vec::new(),
        })
    }

    #[test]
    fn test_parse_greeting() {
        let greeting = Greeting::parse(&greeting_payload(SERVER_CAPS, "mysql_native_password"))
            .unwrap();
        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.connection_id, 42);
        assert_eq!(greeting.scramble, scramble());
        assert_eq!(greeting.capabilities, SERVER_CAPS);
        assert_eq!(greeting.charset, 45);
        assert_eq!(greeting.status_flags, 2);
        assert_eq!(greeting.auth_plugin, "mysql_native_password");
    }

    #[test]
    fn test_parse_greeting_wrong_version() {
        let mut payload = greeting_payload(SERVER_CAPS, "mysql_native_password");
        payload[0] = 9;
        assert!(matches!(
            Greeting::parse(&payload),
            Err(Error::UnsupportedProtocolVersion(9))
        ));
    }

    #[test]
    fn test_parse_greeting_error_packet() {
        let mut payload = vec![0xFF, 0x10, 0x04];
        payload.extend_from_slice(b"Too many connections");
        match Greeting::parse(&payload) {
            Err(Error::Server(e)) => assert_eq!(e.code, 1040),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_greeting_truncated() {
        let payload = greeting_payload(SERVER_CAPS, "mysql_native_password");
        assert!(matches!(
            Greeting::parse(&payload[..10]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_negotiate() {
        let client = DEFAULT_CLIENT_FLAGS | CLIENT_CONNECT_WITH_DB;
        let negotiated = negotiate(client, SERVER_CAPS).unwrap();
        assert_eq!(negotiated & CLIENT_SESSION_TRACK, 0);
        assert_ne!(negotiated & CLIENT_CONNECT_WITH_DB, 0);

        for flag in [CLIENT_SSL, CLIENT_COMPRESS] {
            match negotiate(DEFAULT_CLIENT_FLAGS | flag, SERVER_CAPS) {
                Err(Error::Connection(e)) => {
                    assert_eq!(e.kind, ConnectionErrorKind::CapabilityMismatch);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        assert!(matches!(
            negotiate(DEFAULT_CLIENT_FLAGS, SERVER_CAPS & !CLIENT_PROTOCOL_41),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_handshake_response() {
        let auth = [0xAA; 20];
        let payload = HandshakeResponse {
            capabilities: DEFAULT_CLIENT_FLAGS | CLIENT_CONNECT_WITH_DB,
            max_packet_size: 0xFF_FF_FF,
            charset: 45,
            user: "root",
            auth_response: &auth,
            database: Some("shop"),
            auth_plugin: "mysql_native_password",
        }
        .encode();

        let mut reader = PacketReader::new(&payload);
        assert_eq!(
            reader.read_u32_le(),
            Some(DEFAULT_CLIENT_FLAGS | CLIENT_CONNECT_WITH_DB)
        );
        assert_eq!(reader.read_u32_le(), Some(0xFF_FF_FF));
        assert_eq!(reader.read_u8(), Some(45));
        assert_eq!(reader.read_bytes(23), Some(&[0u8; 23][..]));
        assert_eq!(reader.read_null_string().as_deref(), Some("root"));
        assert_eq!(reader.read_lenenc_bytes(), Some(auth.to_vec()));
        assert_eq!(reader.read_null_string().as_deref(), Some("shop"));
        assert_eq!(
            reader.read_null_string().as_deref(),
            Some("mysql_native_password")
        );
        assert!(reader.is_empty());
    }

    #[test]
    fn test_encode_handshake_response_without_db() {
        let payload = HandshakeResponse {
            capabilities: CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION,
            max_packet_size: 1024,
            charset: 45,
            user: "app",
            auth_response: &[],
            database: Some("ignored"),
            auth_plugin: "mysql_native_password",
        }
        .encode();

        // 32 fixed bytes, "app\0", one-byte zero auth length, nothing else
        assert_eq!(payload.len(), 32 + 4 + 1);
        assert_eq!(payload[36], 0);
    }

    #[test]
    fn test_auth_result_parse() {
        let ok = [0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        assert!(matches!(
            AuthResult::parse(&ok, CLIENT_PROTOCOL_41),
            Ok(AuthResult::Ok(_))
        ));

        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&[7; 20]);
        switch.push(0);
        match AuthResult::parse(&switch, CLIENT_PROTOCOL_41) {
            Ok(AuthResult::Switch(req)) => {
                assert_eq!(req.plugin, "mysql_native_password");
                assert_eq!(req.scramble, vec![7; 20]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mut err = vec![0xFF, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000Access denied for user 'root'");
        match AuthResult::parse(&err, CLIENT_PROTOCOL_41) {
            Err(Error::Authentication(e)) => {
                assert_eq!(e.code, 1045);
                assert_eq!(e.sql_state, "28000");
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(
            AuthResult::parse(&[0x01, 0x03], CLIENT_PROTOCOL_41),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            AuthResult::parse(&[0xFE], CLIENT_PROTOCOL_41),
            Err(Error::UnsupportedAuthPlugin(_))
        ));
    }

    #[test]
    fn test_run_plain_handshake() {
        let mut script = packet(0, &greeting_payload(SERVER_CAPS, "mysql_native_password"));
        script.extend(packet(2, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));

        let config = MySqlConfig::new().user("root").password("secret");
        let mut transport = transport(script);
        let mut handshake = Handshake::new(&config);
        let session = handshake.run(&mut transport).unwrap();

        assert_eq!(handshake.state(), HandshakeState::Ready);
        assert_eq!(session.greeting.connection_id, 42);
        assert_eq!(session.auth_plugin, "mysql_native_password");
        assert_eq!(session.status_flags, 2);
        assert_eq!(transport.sequence_id(), 3);
    }

    #[test]
    fn test_run_auth_switch_to_unknown_plugin() {
        let mut script = packet(0, &greeting_payload(SERVER_CAPS, "mysql_native_password"));
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"caching_sha2_password\0");
        switch.extend_from_slice(&[3; 20]);
        script.extend(packet(2, &switch));

        let config = MySqlConfig::new().user("root").password("secret");
        let mut transport = transport(script);
        let mut handshake = Handshake::new(&config);
        let err = handshake.run(&mut transport).unwrap_err();

        assert!(matches!(err, Error::UnsupportedAuthPlugin(ref p) if p == "caching_sha2_password"));
        assert_eq!(handshake.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_run_tls_against_plain_server_fails_fast() {
        let script = packet(0, &greeting_payload(SERVER_CAPS, "mysql_native_password"));
        let config = MySqlConfig::new()
            .user("root")
            .ssl_mode(crate::config::SslMode::Required);
        let mut transport = transport(script);
        let mut handshake = Handshake::new(&config);

        match handshake.run(&mut transport).unwrap_err() {
            Error::Connection(e) => assert_eq!(e.kind, ConnectionErrorKind::CapabilityMismatch),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(handshake.state(), HandshakeState::Failed);
        // Nothing was sent: no credentials, no SSL request
        assert_eq!(transport.sequence_id(), 1);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_ssl_request_takes_sequence_one() {
        // The server hangs up instead of answering the ClientHello
        let script = packet(0, &greeting_payload(SERVER_CAPS | CLIENT_SSL, "mysql_native_password"));
        let config = MySqlConfig::new()
            .user("root")
            .ssl_mode(crate::config::SslMode::Required);
        let mut transport = transport(script);
        let mut handshake = Handshake::new(&config);

        assert!(handshake.run(&mut transport).is_err());
        assert_eq!(handshake.state(), HandshakeState::Failed);
        // Greeting was 0, the SSL request 1; the response would have gone out as 2
        assert_eq!(transport.sequence_id(), 2);
        assert!(!transport.is_attached());
    }
}
