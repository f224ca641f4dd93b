//! Packet transport.
//!
//! Owns the byte stream and the packet sequence counter. Every packet in
//! either direction advances the counter, and every received packet must
//! carry the expected number. When compression is active, framed packets
//! are routed through the [`CompressionLayer`].

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use sqlwire_core::Error;
use sqlwire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};

use crate::compression::CompressionLayer;
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, frame_payload};

#[cfg(feature = "tls")]
use crate::config::TlsConfig;
#[cfg(feature = "tls")]
use crate::tls::TlsStream;

/// The stream currently carrying the connection.
pub(crate) enum Channel<S: Read + Write> {
    /// Unencrypted stream
    Plain(S),
    /// Stream upgraded to TLS
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<S>>),
    /// The stream was taken away by a failed upgrade or a close
    Detached,
}

impl<S: Read + Write> Channel<S> {
    fn name(&self) -> &'static str {
        match self {
            Channel::Plain(_) => "plain",
            #[cfg(feature = "tls")]
            Channel::Tls(_) => "tls",
            Channel::Detached => "detached",
        }
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection stream is closed")
}

impl<S: Read + Write> Read for Channel<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Channel::Tls(s) => s.read(buf),
            Channel::Detached => Err(detached()),
        }
    }
}

impl<S: Read + Write> Write for Channel<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Channel::Tls(s) => s.write(buf),
            Channel::Detached => Err(detached()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Channel::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Channel::Tls(s) => s.flush(),
            Channel::Detached => Err(detached()),
        }
    }
}

/// Length-prefixed packet framing over a byte stream.
pub struct PacketTransport<S: Read + Write> {
    channel: Channel<S>,
    sequence_id: u8,
    compression: Option<CompressionLayer>,
}

impl<S: Read + Write> std::fmt::Debug for PacketTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketTransport")
            .field("channel", &self.channel.name())
            .field("sequence_id", &self.sequence_id)
            .field("compressed", &self.compression.is_some())
            .finish()
    }
}

impl<S: Read + Write> PacketTransport<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            channel: Channel::Plain(stream),
            sequence_id: 0,
            compression: None,
        }
    }

    /// Get the sequence number the next packet will carry or must carry.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Reset the sequence counters for a new command.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
        if let Some(layer) = &mut self.compression {
            layer.reset_sequence();
        }
    }

    /// Check whether compression has been enabled.
    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Check whether the stream has been upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            matches!(self.channel, Channel::Tls(_))
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// Check whether the stream is still attached.
    pub fn is_attached(&self) -> bool {
        !matches!(self.channel, Channel::Detached)
    }

    /// Route all further traffic through the compressed protocol.
    pub fn enable_compression(&mut self, threshold: usize) -> Result<(), Error> {
        if self.compression.is_some() {
            return Err(protocol_error("Compression is already enabled"));
        }
        tracing::debug!(threshold, "Enabling compressed protocol");
        self.compression = Some(CompressionLayer::new(threshold));
        Ok(())
    }

    /// Replace the plain stream with a TLS session over it.
    ///
    /// On failure the stream is dropped and the transport stays detached.
    #[cfg(feature = "tls")]
    pub fn upgrade_tls(&mut self, tls_config: &TlsConfig, host: &str) -> Result<(), Error> {
        if self.compression.is_some() {
            return Err(protocol_error("TLS must be negotiated before compression"));
        }
        let stream = match std::mem::replace(&mut self.channel, Channel::Detached) {
            Channel::Plain(stream) => stream,
            other => {
                let state = other.name();
                self.channel = other;
                return Err(protocol_error(format!(
                    "Cannot upgrade a {} stream to TLS",
                    state
                )));
            }
        };

        let tls = TlsStream::new(stream, tls_config, host)?;
        tracing::debug!(protocol = ?tls.protocol_version(), "TLS established");
        self.channel = Channel::Tls(Box::new(tls));
        Ok(())
    }

    /// Drop the stream. Further I/O fails with a closed-connection error.
    pub fn detach(&mut self) {
        self.channel = Channel::Detached;
        self.compression = None;
    }

    /// Send one logical payload, splitting it as needed.
    pub fn send_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        let first = self.sequence_id;
        let wire = frame_payload(payload, &mut self.sequence_id);
        tracing::trace!(len = payload.len(), seq = first, "Sending packet");

        let result = match &mut self.compression {
            Some(layer) => layer.write_frames(&mut self.channel, &wire),
            None => self
                .channel
                .write_all(&wire)
                .and_then(|()| self.channel.flush())
                .map_err(Error::Io),
        };
        result.map_err(|e| map_io(e, "write packet"))
    }

    /// Receive one logical payload, reassembling chained packets.
    pub fn receive_packet(&mut self) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::new();
        loop {
            let mut header_buf = [0u8; PacketHeader::SIZE];
            self.read_exact(&mut header_buf, "read packet header")?;
            let header = PacketHeader::from_bytes(&header_buf);

            if header.sequence_id != self.sequence_id {
                return Err(Error::Protocol(ProtocolError {
                    message: format!(
                        "Packet sequence mismatch: expected {}, got {}",
                        self.sequence_id, header.sequence_id
                    ),
                    raw_data: Some(header_buf.to_vec()),
                    source: None,
                }));
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..], "read packet payload")?;

            if len < MAX_PACKET_SIZE {
                break;
            }
        }

        tracing::trace!(len = payload.len(), "Received packet");
        Ok(payload)
    }

    fn read_exact(&mut self, buf: &mut [u8], context: &str) -> Result<(), Error> {
        let result = match &mut self.compression {
            Some(layer) => layer.read_exact(&mut self.channel, buf),
            None => self.channel.read_exact(buf).map_err(Error::Io),
        };
        result.map_err(|e| map_io(e, context))
    }
}

/// Turn raw I/O failures into connection errors; other errors pass through.
fn map_io(err: Error, context: &str) -> Error {
    let Error::Io(e) = err else {
        return err;
    };
    let kind = match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectionErrorKind::Timeout,
        io::ErrorKind::NotConnected => ConnectionErrorKind::Closed,
        _ => ConnectionErrorKind::Disconnected,
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("Failed to {}: {}", context, e),
        source: Some(Box::new(e)),
    })
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}
