//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple packets.
//!
//! Server responses are decoded through [`ServerPacket`], which classifies a
//! payload by its leading byte. The meaning of that byte depends on where in
//! the conversation the packet arrives, so there is one entry point per
//! context: the first response to a command, and a row of a result set.

pub mod reader;
pub mod writer;

use serde::Serialize;
use sqlwire_core::ServerError;

pub use reader::PacketReader;
pub use writer::{PacketWriter, frame_payload};

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities requested on every connection.
    ///
    /// SSL, COMPRESS and CONNECT_WITH_DB are added by the configuration.
    /// MULTI_RESULTS is left out: a query yields exactly one response.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_TRANSACTIONS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF;

    /// Check whether `flag` is set in `flags`.
    pub const fn has(flags: u32, flag: u32) -> bool {
        flags & flag != 0
    }
}

/// MySQL command codes (COM_xxx) issued by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
    /// Reset session state without re-authenticating
    ResetConnection = 0x1f,
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// MySQL character set codes.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Default charset for new connections.
    ///
    /// `utf8mb4_general_ci` is understood by MySQL 5.5+ and every MariaDB
    /// release, unlike the 8.0-only `utf8mb4_0900_ai_ci`.
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Human readable status information (may be empty)
    pub info: String,
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters, empty if the server omitted it)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl From<ErrPacket> for ServerError {
    fn from(err: ErrPacket) -> Self {
        ServerError {
            code: err.error_code,
            sql_state: err.sql_state,
            message: err.error_message,
        }
    }
}

/// Parsed EOF packet (replaced by an OK packet under `CLIENT_DEPRECATE_EOF`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

/// A server packet classified by its leading byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket<'a> {
    /// OK acknowledgement (0x00, or 0xFE closing a result set under DEPRECATE_EOF)
    Ok(OkPacket),
    /// ERR packet (0xFF)
    Err(ErrPacket),
    /// Legacy EOF packet (0xFE with a payload shorter than 9 bytes)
    Eof(EofPacket),
    /// LOCAL INFILE request (0xFB) carrying the file name the server wants
    LocalInfile(String),
    /// Anything else: a column count or a row, left for the caller to decode
    Data(&'a [u8]),
}

impl<'a> ServerPacket<'a> {
    /// Classify the first packet returned for a command.
    pub fn command_response(payload: &'a [u8], capabilities: u32) -> Result<Self, String> {
        match payload.first() {
            None => Err("Empty response packet".to_string()),
            Some(0x00) => parse_ok(payload, capabilities),
            Some(0xFF) => parse_err(payload),
            Some(0xFB) => {
                let mut reader = PacketReader::new(&payload[1..]);
                Ok(ServerPacket::LocalInfile(reader.read_rest_string()))
            }
            Some(_) => Ok(ServerPacket::Data(payload)),
        }
    }

    /// Classify a packet read while a result set is streaming.
    ///
    /// A row may begin with 0x00 (empty string) or 0xFB (NULL), so only ERR
    /// and the 0xFE terminator are recognised here.
    pub fn result_row(payload: &'a [u8], capabilities: u32) -> Result<Self, String> {
        match payload.first() {
            Some(0xFF) => parse_err(payload),
            Some(0xFE) if is_terminator(payload.len(), capabilities) => {
                if capabilities::has(capabilities, capabilities::CLIENT_DEPRECATE_EOF) {
                    parse_ok(payload, capabilities)
                } else {
                    let mut reader = PacketReader::new(payload);
                    reader
                        .parse_eof_packet()
                        .map(ServerPacket::Eof)
                        .ok_or_else(|| "Truncated EOF packet".to_string())
                }
            }
            _ => Ok(ServerPacket::Data(payload)),
        }
    }
}

fn is_terminator(len: usize, capabilities: u32) -> bool {
    if capabilities::has(capabilities, capabilities::CLIENT_DEPRECATE_EOF) {
        len < MAX_PACKET_SIZE
    } else {
        len < 9
    }
}

fn parse_ok(payload: &[u8], capabilities: u32) -> Result<ServerPacket<'_>, String> {
    PacketReader::new(payload)
        .parse_ok_packet(capabilities)
        .map(ServerPacket::Ok)
        .ok_or_else(|| "Truncated OK packet".to_string())
}

fn parse_err(payload: &[u8]) -> Result<ServerPacket<'_>, String> {
    PacketReader::new(payload)
        .parse_err_packet()
        .map(ServerPacket::Err)
        .ok_or_else(|| "Truncated ERR packet".to_string())
}
