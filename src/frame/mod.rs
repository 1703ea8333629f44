//! CQL native protocol framing: header codec, compression, opcodes.

pub mod request;
pub mod response;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 9;

/// Stream id reserved for server-initiated event frames.
pub const EVENT_STREAM: i16 = -1;

/// The CQL version announced in STARTUP.
pub const CQL_VERSION: &str = "3.0.0";

const FLAG_COMPRESSED: u8 = 0x01;
const DIRECTION_RESPONSE: u8 = 0x80;

/// Protocol versions supported by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Version {
    V3,
    #[default]
    V4,
}

impl Version {
    pub(crate) fn request_byte(self) -> u8 {
        match self {
            Version::V3 => 0x03,
            Version::V4 => 0x04,
        }
    }

    pub(crate) fn response_byte(self) -> u8 {
        self.request_byte() | DIRECTION_RESPONSE
    }

    /// Largest stream-id space the protocol admits. The header carries
    /// a signed 16-bit id in both versions; negative ids belong to the
    /// server.
    pub fn max_streams_ceiling(self) -> usize {
        32768
    }
}

/// Consistency level carried by QUERY, EXECUTE and BATCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    #[default]
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    pub fn to_u16(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::Serial => 0x0008,
            Consistency::LocalSerial => 0x0009,
            Consistency::LocalOne => 0x000A,
        }
    }

    pub fn from_u16(code: u16) -> Result<Self> {
        Ok(match code {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            other => return Err(Error::Parse(format!("unknown consistency 0x{other:04x}"))),
        })
    }
}

/// Frame opcodes, client- and server-initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        Ok(match b {
            0x00 => OpCode::Error,
            0x01 => OpCode::Startup,
            0x02 => OpCode::Ready,
            0x03 => OpCode::Authenticate,
            0x05 => OpCode::Options,
            0x06 => OpCode::Supported,
            0x07 => OpCode::Query,
            0x08 => OpCode::Result,
            0x09 => OpCode::Prepare,
            0x0A => OpCode::Execute,
            0x0B => OpCode::Register,
            0x0C => OpCode::Event,
            0x0D => OpCode::Batch,
            0x0E => OpCode::AuthChallenge,
            0x0F => OpCode::AuthResponse,
            0x10 => OpCode::AuthSuccess,
            other => return Err(Error::Parse(format!("unknown opcode 0x{other:02x}"))),
        })
    }
}

/// Server event classes a connection can subscribe to with REGISTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

/// The 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: OpCode,
    pub length: u32,
}

impl Header {
    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version);
        dst.put_u8(self.flags);
        dst.put_i16(self.stream);
        dst.put_u8(self.opcode as u8);
        dst.put_u32(self.length);
    }

    pub fn unpack(src: &[u8]) -> Result<Header> {
        if src.len() < HEADER_LEN {
            return Err(Error::Parse("truncated frame header".into()));
        }
        Ok(Header {
            version: src[0],
            flags: src[1],
            stream: i16::from_be_bytes([src[2], src[3]]),
            opcode: OpCode::try_from(src[4])?,
            length: u32::from_be_bytes([src[5], src[6], src[7], src[8]]),
        })
    }
}

/// A complete frame off the wire, body decompressed but otherwise
/// undecoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: Header,
    pub body: Bytes,
}

/// Body compression negotiated at STARTUP. STARTUP and OPTIONS frames
/// always travel uncompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Snappy,
}

impl Compression {
    /// Algorithm name as it appears in the server's SUPPORTED options.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lz4 => Some("lz4"),
            Compression::Snappy => Some("snappy"),
        }
    }

    pub(crate) fn compress(self, body: &[u8]) -> Result<Bytes> {
        match self {
            Compression::None => Ok(Bytes::copy_from_slice(body)),
            Compression::Lz4 => {
                // lz4 bodies carry the uncompressed length big-endian
                // up front, per the protocol spec
                let mut out = BytesMut::with_capacity(4 + body.len());
                out.put_u32(body.len() as u32);
                out.extend_from_slice(&lz4_flex::block::compress(body));
                Ok(out.freeze())
            }
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(body)
                .map(Bytes::from)
                .map_err(|e| Error::Parse(format!("snappy compression failed: {e}"))),
        }
    }

    pub(crate) fn decompress(self, body: &[u8]) -> Result<Bytes> {
        match self {
            Compression::None => Err(Error::Parse(
                "compressed frame without negotiated compression".into(),
            )),
            Compression::Lz4 => {
                if body.len() < 4 {
                    return Err(Error::Parse("truncated lz4 body".into()));
                }
                let n = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
                lz4_flex::block::decompress(&body[4..], n)
                    .map(Bytes::from)
                    .map_err(|e| Error::Parse(format!("lz4 decompression failed: {e}")))
            }
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(body)
                .map(Bytes::from)
                .map_err(|e| Error::Parse(format!("snappy decompression failed: {e}"))),
        }
    }
}

/// Streaming decoder for server frames, driven by the reader task
/// through a `FramedRead`.
pub struct FrameCodec {
    version: Version,
    compression: Compression,
    max_body: usize,
}

impl FrameCodec {
    pub fn new(version: Version, compression: Compression, max_body: usize) -> Self {
        FrameCodec {
            version,
            compression,
            max_body,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::unpack(&src[..HEADER_LEN])?;
        if header.version != self.version.response_byte() {
            return Err(Error::Parse(format!(
                "unexpected frame version 0x{:02x}",
                header.version
            )));
        }
        let body_len = header.length as usize;
        if body_len > self.max_body {
            return Err(Error::Parse(format!(
                "frame body of {body_len} bytes exceeds receive buffer"
            )));
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let raw = src.split_to(body_len).freeze();
        let body = if header.flags & FLAG_COMPRESSED != 0 {
            self.compression.decompress(&raw)?
        } else {
            raw
        };
        Ok(Some(RawFrame { header, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = Header {
            version: Version::V4.response_byte(),
            flags: 0,
            stream: 513,
            opcode: OpCode::Result,
            length: 42,
        };
        let mut buf = BytesMut::new();
        header.pack(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let parsed = Header::unpack(&buf).unwrap();
        assert_eq!(parsed.version, 0x84);
        assert_eq!(parsed.stream, 513);
        assert_eq!(parsed.opcode, OpCode::Result);
        assert_eq!(parsed.length, 42);
    }

    #[test]
    fn event_stream_id_survives_the_sign() {
        let header = Header {
            version: Version::V4.response_byte(),
            flags: 0,
            stream: EVENT_STREAM,
            opcode: OpCode::Event,
            length: 0,
        };
        let mut buf = BytesMut::new();
        header.pack(&mut buf);
        assert_eq!(Header::unpack(&buf).unwrap().stream, -1);
    }

    #[test]
    fn codec_waits_for_a_full_frame() {
        let mut codec = FrameCodec::new(Version::V4, Compression::None, 1 << 20);
        let header = Header {
            version: Version::V4.response_byte(),
            flags: 0,
            stream: 3,
            opcode: OpCode::Ready,
            length: 4,
        };
        let mut wire = BytesMut::new();
        header.pack(&mut wire);
        wire.extend_from_slice(&[1, 2, 3, 4]);

        let mut partial = BytesMut::from(&wire[..HEADER_LEN + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut full = wire.clone();
        let frame = codec.decode(&mut full).unwrap().unwrap();
        assert_eq!(frame.header.stream, 3);
        assert_eq!(&frame.body[..], &[1, 2, 3, 4]);
        assert!(full.is_empty());
    }

    #[test]
    fn codec_rejects_oversized_bodies() {
        let mut codec = FrameCodec::new(Version::V4, Compression::None, 8);
        let header = Header {
            version: Version::V4.response_byte(),
            flags: 0,
            stream: 0,
            opcode: OpCode::Result,
            length: 64,
        };
        let mut wire = BytesMut::new();
        header.pack(&mut wire);
        assert!(matches!(codec.decode(&mut wire), Err(Error::Parse(_))));
    }

    #[test]
    fn lz4_round_trip() {
        let body = b"select * from system.peers where token > ?".repeat(8);
        let packed = Compression::Lz4.compress(&body).unwrap();
        let unpacked = Compression::Lz4.decompress(&packed).unwrap();
        assert_eq!(&unpacked[..], &body[..]);
    }

    #[test]
    fn snappy_round_trip() {
        let body = b"0123456789".repeat(100);
        let packed = Compression::Snappy.compress(&body).unwrap();
        let unpacked = Compression::Snappy.decompress(&packed).unwrap();
        assert_eq!(&unpacked[..], &body[..]);
    }
}
