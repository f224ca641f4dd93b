//! MySQL compressed protocol (`CLIENT_COMPRESS`).
//!
//! Once enabled, every byte of the regular packet stream travels inside
//! compressed frames with a 7-byte header:
//! - 3 bytes: length of the frame body as sent
//! - 1 byte: compressed sequence number
//! - 3 bytes: length of the body after inflation, 0 if the body is sent raw
//!
//! A frame body holds complete wire packets, headers included. Bodies no
//! longer than the threshold are sent raw. The compressed sequence counter
//! is independent of the packet counter but resets at the same points.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sqlwire_core::Error;
use sqlwire_core::error::ProtocolError;

use crate::protocol::{MAX_PACKET_SIZE, PacketReader};

/// Size of a compressed frame header.
pub const FRAME_HEADER_SIZE: usize = 7;

/// Default threshold below which frame bodies are sent uncompressed.
pub const DEFAULT_THRESHOLD: usize = 50;

/// Header of one compressed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the body as it appears on the wire
    pub compressed_length: u32,
    /// Compressed sequence number
    pub sequence_id: u8,
    /// Inflated length of the body, 0 when the body is not compressed
    pub uncompressed_length: u32,
}

impl FrameHeader {
    /// Parse a frame header.
    pub fn from_bytes(bytes: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let mut reader = PacketReader::new(bytes);
        Self {
            compressed_length: reader.read_u24_le().unwrap_or_default(),
            sequence_id: reader.read_u8().unwrap_or_default(),
            uncompressed_length: reader.read_u24_le().unwrap_or_default(),
        }
    }

    /// Encode the header.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let c = self.compressed_length.to_le_bytes();
        let u = self.uncompressed_length.to_le_bytes();
        [c[0], c[1], c[2], self.sequence_id, u[0], u[1], u[2]]
    }
}

/// Encode one frame around `body`, compressing it when it is longer than
/// `threshold` and deflating actually makes it smaller.
pub fn encode_frame(body: &[u8], sequence_id: u8, threshold: usize) -> Result<Vec<u8>, Error> {
    debug_assert!(body.len() <= MAX_PACKET_SIZE);

    let deflated = if body.len() > threshold {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
        encoder.write_all(body)?;
        Some(encoder.finish()?).filter(|d| d.len() < body.len())
    } else {
        None
    };

    let (header, data) = match &deflated {
        Some(d) => (
            FrameHeader {
                compressed_length: d.len() as u32,
                sequence_id,
                uncompressed_length: body.len() as u32,
            },
            d.as_slice(),
        ),
        None => (
            FrameHeader {
                compressed_length: body.len() as u32,
                sequence_id,
                uncompressed_length: 0,
            },
            body,
        ),
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Decode a frame body read off the wire.
pub fn decode_frame(header: &FrameHeader, body: &[u8]) -> Result<Vec<u8>, Error> {
    if header.uncompressed_length == 0 {
        return Ok(body.to_vec());
    }

    let expected = header.uncompressed_length as usize;
    let mut inflated = Vec::with_capacity(expected);
    ZlibDecoder::new(body)
        .read_to_end(&mut inflated)
        .map_err(|e| compression_error(format!("Failed to inflate frame: {}", e)))?;

    if inflated.len() != expected {
        return Err(compression_error(format!(
            "Inflated frame is {} bytes, header announced {}",
            inflated.len(),
            expected
        )));
    }
    Ok(inflated)
}

/// Compression state for one connection.
///
/// Outgoing data is framed and written in one go. Incoming frames are
/// inflated into a buffer that the packet layer reads from.
#[derive(Debug)]
pub struct CompressionLayer {
    sequence_id: u8,
    threshold: usize,
    inbound: Vec<u8>,
    position: usize,
}

impl CompressionLayer {
    /// Create a compression layer with the given threshold.
    pub fn new(threshold: usize) -> Self {
        Self {
            sequence_id: 0,
            threshold,
            inbound: Vec::new(),
            position: 0,
        }
    }

    /// Get the next expected compressed sequence number.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Reset the compressed sequence counter (new command).
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    /// Wrap already framed packets in compressed frames and write them.
    ///
    /// Data longer than one frame is chunked. As with plain packets, a
    /// frame carrying exactly `MAX_PACKET_SIZE` bytes is followed by an
    /// empty one.
    pub fn write_frames<W: Write>(&mut self, writer: &mut W, data: &[u8]) -> Result<(), Error> {
        let mut chunks = data.chunks(MAX_PACKET_SIZE);
        loop {
            let chunk = chunks.next().unwrap_or_default();
            let frame = encode_frame(chunk, self.sequence_id, self.threshold)?;
            self.sequence_id = self.sequence_id.wrapping_add(1);
            writer.write_all(&frame)?;
            if chunk.len() < MAX_PACKET_SIZE {
                break;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Fill `buf` from the inflated stream, reading frames as needed.
    pub fn read_exact<R: Read>(&mut self, reader: &mut R, buf: &mut [u8]) -> Result<(), Error> {
        while self.inbound.len() - self.position < buf.len() {
            self.read_frames(reader)?;
        }

        let end = self.position + buf.len();
        buf.copy_from_slice(&self.inbound[self.position..end]);
        self.position = end;

        if self.position == self.inbound.len() {
            self.inbound.clear();
            self.position = 0;
        }
        Ok(())
    }

    /// Read one chain of frames, ending at the first frame that carries
    /// fewer than `MAX_PACKET_SIZE` bytes, and append its contents to the
    /// inbound buffer.
    fn read_frames<R: Read>(&mut self, reader: &mut R) -> Result<(), Error> {
        loop {
            let mut header_buf = [0u8; FRAME_HEADER_SIZE];
            reader.read_exact(&mut header_buf)?;
            let header = FrameHeader::from_bytes(&header_buf);

            if header.sequence_id != self.sequence_id {
                return Err(compression_error(format!(
                    "Compressed sequence mismatch: expected {}, got {}",
                    self.sequence_id, header.sequence_id
                )));
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);

            let mut body = vec![0u8; header.compressed_length as usize];
            reader.read_exact(&mut body)?;

            if self.position > 0 {
                self.inbound.drain(..self.position);
                self.position = 0;
            }
            let contents = decode_frame(&header, &body)?;
            let carried = contents.len();
            self.inbound.extend(contents);

            if carried < MAX_PACKET_SIZE {
                return Ok(());
            }
        }
    }
}

fn compression_error(message: String) -> Error {
    Error::Protocol(ProtocolError {
        message,
        raw_data: None,
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_header_roundtrip() {
        let header = FrameHeader {
            compressed_length: 0x0001_0203,
            sequence_id: 9,
            uncompressed_length: 0x0004_0506,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x03, 0x02, 0x01, 9, 0x06, 0x05, 0x04]);
        assert_eq!(FrameHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_small_body_sent_raw() {
        let body = b"\x05\x00\x00\x00\x03ping";
        let frame = encode_frame(body, 0, DEFAULT_THRESHOLD).unwrap();
        assert_eq!(&frame[..7], &[9, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&frame[7..], body);
    }

    #[test]
    fn test_large_body_compressed() {
        let body = vec![b'x'; 1000];
        let frame = encode_frame(&body, 3, DEFAULT_THRESHOLD).unwrap();
        let header = FrameHeader::from_bytes(frame[..7].try_into().unwrap());

        assert_eq!(header.sequence_id, 3);
        assert_eq!(header.uncompressed_length, 1000);
        assert!((header.compressed_length as usize) < body.len());
        assert_eq!(decode_frame(&header, &frame[7..]).unwrap(), body);
    }

    #[test]
    fn test_incompressible_body_sent_raw() {
        // 64 distinct bytes do not shrink under zlib
        let body: Vec<u8> = (0u8..64).map(|i| i.wrapping_mul(37)).collect();
        let frame = encode_frame(&body, 0, 0).unwrap();
        let header = FrameHeader::from_bytes(frame[..7].try_into().unwrap());
        assert_eq!(header.uncompressed_length, 0);
        assert_eq!(&frame[7..], body.as_slice());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let body = vec![b'y'; 200];
        let frame = encode_frame(&body, 0, 0).unwrap();
        let mut header = FrameHeader::from_bytes(frame[..7].try_into().unwrap());
        header.uncompressed_length = 150;
        assert!(matches!(
            decode_frame(&header, &frame[7..]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_layer_roundtrip_across_frames() {
        let mut writer_side = CompressionLayer::new(0);
        let mut wire = Vec::new();
        writer_side.write_frames(&mut wire, &[b'a'; 300]).unwrap();
        writer_side.write_frames(&mut wire, b"tail").unwrap();
        assert_eq!(writer_side.sequence_id(), 2);

        let mut reader_side = CompressionLayer::new(0);
        let mut cursor = Cursor::new(wire);
        let mut first = [0u8; 100];
        reader_side.read_exact(&mut cursor, &mut first).unwrap();
        assert_eq!(first, [b'a'; 100]);

        // Spans the rest of frame 0 and all of frame 1
        let mut rest = [0u8; 204];
        reader_side.read_exact(&mut cursor, &mut rest).unwrap();
        assert_eq!(&rest[..200], &[b'a'; 200][..]);
        assert_eq!(&rest[200..], b"tail");
        assert_eq!(reader_side.sequence_id(), 2);
    }

    fn roundtrip_large(len: usize, expected_frames: u8) {
        let data = vec![b'a'; len];
        let mut writer_side = CompressionLayer::new(DEFAULT_THRESHOLD);
        let mut wire = Vec::new();
        writer_side.write_frames(&mut wire, &data).unwrap();
        assert_eq!(writer_side.sequence_id(), expected_frames);
        // Highly compressible, so the wire is far smaller than the data
        assert!(wire.len() < len / 100);

        let mut reader_side = CompressionLayer::new(DEFAULT_THRESHOLD);
        let mut cursor = Cursor::new(wire);
        let mut buf = vec![0u8; len];
        reader_side.read_exact(&mut cursor, &mut buf).unwrap();
        assert!(buf == data);
        assert_eq!(reader_side.sequence_id(), expected_frames);
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());
    }

    #[test]
    fn test_layer_roundtrip_exact_max_chunk() {
        // A full chunk is followed by an empty frame
        roundtrip_large(MAX_PACKET_SIZE, 2);
    }

    #[test]
    fn test_layer_roundtrip_past_max_chunk() {
        roundtrip_large(MAX_PACKET_SIZE + 1000, 2);
    }

    #[test]
    fn test_layer_sequence_mismatch() {
        let mut wire = Vec::new();
        wire.extend(encode_frame(b"abc", 4, DEFAULT_THRESHOLD).unwrap());

        let mut layer = CompressionLayer::new(DEFAULT_THRESHOLD);
        let mut buf = [0u8; 3];
        let err = layer
            .read_exact(&mut Cursor::new(wire), &mut buf)
            .unwrap_err();
        assert!(err.to_string().contains("expected 0, got 4"));
    }

    #[test]
    fn test_reset_sequence() {
        let mut layer = CompressionLayer::new(DEFAULT_THRESHOLD);
        let mut sink = Vec::new();
        layer.write_frames(&mut sink, b"one").unwrap();
        assert_eq!(layer.sequence_id(), 1);
        layer.reset_sequence();
        assert_eq!(layer.sequence_id(), 0);
    }
}
