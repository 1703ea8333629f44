//! Client request frames and their wire encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Compression, Consistency, EventType, Header, OpCode, Version, CQL_VERSION};
use crate::error::Result;

/// Server-assigned identifier of a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryId(pub Bytes);

/// One pre-serialized CQL value; `None` encodes a null cell. Value
/// typing is the caller's concern.
pub type Value = Option<Bytes>;

/// Parameters shared by QUERY and EXECUTE.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub consistency: Consistency,
    pub values: Vec<Value>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<Consistency>,
}

impl QueryParams {
    pub fn with_consistency(consistency: Consistency) -> Self {
        QueryParams {
            consistency,
            ..Default::default()
        }
    }
}

/// Kind of a BATCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged,
    Unlogged,
    Counter,
}

/// One statement within a BATCH.
#[derive(Debug, Clone)]
pub enum BatchStatement {
    Query { text: String, values: Vec<Value> },
    Prepared { id: QueryId, values: Vec<Value> },
}

/// A client request frame body.
#[derive(Debug, Clone)]
pub enum Request {
    Startup {
        compression: Compression,
    },
    Options,
    Query {
        text: String,
        params: QueryParams,
    },
    Prepare {
        text: String,
    },
    Execute {
        id: QueryId,
        params: QueryParams,
    },
    Batch {
        ty: BatchType,
        statements: Vec<BatchStatement>,
        consistency: Consistency,
    },
    Register {
        events: Vec<EventType>,
    },
    AuthResponse {
        token: Bytes,
    },
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Startup { .. } => OpCode::Startup,
            Request::Options => OpCode::Options,
            Request::Query { .. } => OpCode::Query,
            Request::Prepare { .. } => OpCode::Prepare,
            Request::Execute { .. } => OpCode::Execute,
            Request::Batch { .. } => OpCode::Batch,
            Request::Register { .. } => OpCode::Register,
            Request::AuthResponse { .. } => OpCode::AuthResponse,
        }
    }

    /// STARTUP and OPTIONS travel uncompressed regardless of the
    /// negotiated algorithm.
    pub fn compressible(&self) -> bool {
        !matches!(self, Request::Startup { .. } | Request::Options)
    }

    /// Consistency carried by this request, if it carries one. The
    /// retry engine rewrites it when `reduced_consistency` is set.
    pub fn consistency_mut(&mut self) -> Option<&mut Consistency> {
        match self {
            Request::Query { params, .. } | Request::Execute { params, .. } => {
                Some(&mut params.consistency)
            }
            Request::Batch { consistency, .. } => Some(consistency),
            _ => None,
        }
    }

    /// Frames the request for the wire under stream id `stream`.
    pub fn encode(
        &self,
        version: Version,
        compression: Compression,
        stream: i16,
    ) -> Result<Bytes> {
        let mut body = BytesMut::new();
        self.serialize_body(&mut body);

        let (flags, body) = if compression != Compression::None && self.compressible() {
            (super::FLAG_COMPRESSED, compression.compress(&body)?)
        } else {
            (0, body.freeze())
        };

        let header = Header {
            version: version.request_byte(),
            flags,
            stream,
            opcode: self.opcode(),
            length: body.len() as u32,
        };
        let mut frame = BytesMut::with_capacity(super::HEADER_LEN + body.len());
        header.pack(&mut frame);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    fn serialize_body(&self, dst: &mut BytesMut) {
        match self {
            Request::Startup { compression } => {
                let mut pairs: Vec<(&str, &str)> = vec![("CQL_VERSION", CQL_VERSION)];
                if let Some(name) = compression.name() {
                    pairs.push(("COMPRESSION", name));
                }
                dst.put_u16(pairs.len() as u16);
                for (k, v) in pairs {
                    put_string(dst, k);
                    put_string(dst, v);
                }
            }
            Request::Options => {}
            Request::Query { text, params } => {
                put_long_string(dst, text);
                put_query_params(dst, params);
            }
            Request::Prepare { text } => {
                put_long_string(dst, text);
            }
            Request::Execute { id, params } => {
                put_short_bytes(dst, &id.0);
                put_query_params(dst, params);
            }
            Request::Batch {
                ty,
                statements,
                consistency,
            } => {
                dst.put_u8(match ty {
                    BatchType::Logged => 0,
                    BatchType::Unlogged => 1,
                    BatchType::Counter => 2,
                });
                dst.put_u16(statements.len() as u16);
                for stmt in statements {
                    match stmt {
                        BatchStatement::Query { text, values } => {
                            dst.put_u8(0);
                            put_long_string(dst, text);
                            put_values(dst, values);
                        }
                        BatchStatement::Prepared { id, values } => {
                            dst.put_u8(1);
                            put_short_bytes(dst, &id.0);
                            put_values(dst, values);
                        }
                    }
                }
                dst.put_u16(consistency.to_u16());
                dst.put_u8(0); // batch flags
            }
            Request::Register { events } => {
                dst.put_u16(events.len() as u16);
                for ev in events {
                    put_string(dst, ev.as_str());
                }
            }
            Request::AuthResponse { token } => {
                dst.put_i32(token.len() as i32);
                dst.extend_from_slice(token);
            }
        }
    }
}

const FLAG_VALUES: u8 = 0x01;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_PAGING_STATE: u8 = 0x08;
const FLAG_SERIAL_CONSISTENCY: u8 = 0x10;

fn put_query_params(dst: &mut BytesMut, params: &QueryParams) {
    dst.put_u16(params.consistency.to_u16());

    let mut flags = 0u8;
    if !params.values.is_empty() {
        flags |= FLAG_VALUES;
    }
    if params.page_size.is_some() {
        flags |= FLAG_PAGE_SIZE;
    }
    if params.paging_state.is_some() {
        flags |= FLAG_PAGING_STATE;
    }
    if params.serial_consistency.is_some() {
        flags |= FLAG_SERIAL_CONSISTENCY;
    }
    dst.put_u8(flags);

    if !params.values.is_empty() {
        put_values(dst, &params.values);
    }
    if let Some(n) = params.page_size {
        dst.put_i32(n);
    }
    if let Some(state) = &params.paging_state {
        dst.put_i32(state.len() as i32);
        dst.extend_from_slice(state);
    }
    if let Some(sc) = params.serial_consistency {
        dst.put_u16(sc.to_u16());
    }
}

fn put_values(dst: &mut BytesMut, values: &[Value]) {
    dst.put_u16(values.len() as u16);
    for value in values {
        match value {
            Some(bytes) => {
                dst.put_i32(bytes.len() as i32);
                dst.extend_from_slice(bytes);
            }
            None => dst.put_i32(-1),
        }
    }
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.extend_from_slice(s.as_bytes());
}

fn put_long_string(dst: &mut BytesMut, s: &str) {
    dst.put_i32(s.len() as i32);
    dst.extend_from_slice(s.as_bytes());
}

fn put_short_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u16(b.len() as u16);
    dst.extend_from_slice(b);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_announces_cql_version_and_compression() {
        let req = Request::Startup {
            compression: Compression::Lz4,
        };
        let frame = req.encode(Version::V4, Compression::Lz4, 0).unwrap();
        // compression never applies to STARTUP itself
        assert_eq!(frame[1], 0);
        let body = &frame[super::super::HEADER_LEN..];
        let text = String::from_utf8_lossy(body);
        assert!(text.contains("CQL_VERSION"));
        assert!(text.contains("3.0.0"));
        assert!(text.contains("lz4"));
    }

    #[test]
    fn query_frame_carries_stream_and_consistency() {
        let req = Request::Query {
            text: "SELECT peer FROM system.peers".into(),
            params: QueryParams::with_consistency(Consistency::One),
        };
        let frame = req.encode(Version::V4, Compression::None, 7).unwrap();
        let header = Header::unpack(&frame).unwrap();
        assert_eq!(header.stream, 7);
        assert_eq!(header.opcode, OpCode::Query);
        assert_eq!(header.length as usize, frame.len() - super::super::HEADER_LEN);

        let body = &frame[super::super::HEADER_LEN..];
        let text_len = i32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let consistency_at = 4 + text_len;
        let consistency =
            u16::from_be_bytes([body[consistency_at], body[consistency_at + 1]]);
        assert_eq!(consistency, Consistency::One.to_u16());
    }

    #[test]
    fn consistency_rewrite_reaches_each_request_kind() {
        let mut query = Request::Query {
            text: "x".into(),
            params: QueryParams::default(),
        };
        let mut batch = Request::Batch {
            ty: BatchType::Logged,
            statements: vec![],
            consistency: Consistency::Quorum,
        };
        let mut options = Request::Options;

        *query.consistency_mut().unwrap() = Consistency::One;
        *batch.consistency_mut().unwrap() = Consistency::One;
        assert!(options.consistency_mut().is_none());

        match query {
            Request::Query { params, .. } => assert_eq!(params.consistency, Consistency::One),
            _ => unreachable!(),
        }
        match batch {
            Request::Batch { consistency, .. } => assert_eq!(consistency, Consistency::One),
            _ => unreachable!(),
        }
    }

    #[test]
    fn null_values_encode_as_negative_length() {
        let mut dst = BytesMut::new();
        put_values(&mut dst, &[Some(Bytes::from_static(b"ab")), None]);
        assert_eq!(
            &dst[..],
            &[0, 2, 0, 0, 0, 2, b'a', b'b', 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }
}
