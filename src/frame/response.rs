//! Server response frames: body parsing and the server error taxonomy.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, Bytes};
use thiserror::Error as ThisError;

use super::request::QueryId;
use super::{Consistency, OpCode};
use crate::error::{Error, Result};

/// A server error carried inside a normal [`Response`].
#[derive(Debug, Clone, PartialEq, ThisError)]
#[error("{message} (code 0x{code:08x})")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub code: i32,
    pub message: String,
}

impl DbError {
    /// Error kinds the retry engine is allowed to re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DbErrorKind::ReadTimeout { .. }
                | DbErrorKind::WriteTimeout { .. }
                | DbErrorKind::Overloaded
                | DbErrorKind::Unavailable { .. }
                | DbErrorKind::ServerError
        )
    }
}

/// The server's own error taxonomy (protocol §9 error codes). Kinds the
/// client never inspects keep only their code and message.
#[derive(Debug, Clone, PartialEq)]
pub enum DbErrorKind {
    ServerError,
    ProtocolError,
    AuthenticationError,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    Overloaded,
    IsBootstrapping,
    TruncateError,
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: String,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },
    ReadFailure,
    FunctionFailure,
    WriteFailure,
    SyntaxError,
    Unauthorized,
    Invalid,
    ConfigError,
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: QueryId,
    },
    Other(i32),
}

/// Server push events delivered on stream -1.
#[derive(Debug, Clone)]
pub enum Event {
    Topology {
        change: TopologyChange,
        addr: SocketAddr,
    },
    Status {
        change: StatusChange,
        addr: SocketAddr,
    },
    /// Schema events are parsed but not interpreted by the controller.
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Up,
    Down,
}

/// A decoded RESULT body.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(Prepared),
    SchemaChange,
}

/// Result rows; cells pass through as raw bytes.
#[derive(Debug, Clone)]
pub struct Rows {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

/// Column metadata; the column's CQL type is consumed but not modeled.
#[derive(Debug, Clone)]
pub struct Column {
    pub keyspace: String,
    pub table: String,
    pub name: String,
}

/// A PREPARED result; only the statement id is of interest here.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: QueryId,
}

/// A server response frame, decoded.
#[derive(Debug, Clone)]
pub enum Response {
    Ready,
    Authenticate { mechanism: String },
    AuthChallenge { token: Option<Bytes> },
    AuthSuccess { token: Option<Bytes> },
    Supported { options: HashMap<String, Vec<String>> },
    Result(QueryResult),
    Error(DbError),
    Event(Event),
}

impl Response {
    /// Decodes a frame body for `opcode`.
    pub fn parse(opcode: OpCode, body: Bytes) -> Result<Response> {
        let mut buf = body;
        Ok(match opcode {
            OpCode::Ready => Response::Ready,
            OpCode::Authenticate => Response::Authenticate {
                mechanism: get_string(&mut buf)?,
            },
            OpCode::AuthChallenge => Response::AuthChallenge {
                token: get_bytes(&mut buf)?,
            },
            OpCode::AuthSuccess => Response::AuthSuccess {
                token: get_bytes(&mut buf)?,
            },
            OpCode::Supported => Response::Supported {
                options: get_string_multimap(&mut buf)?,
            },
            OpCode::Result => Response::Result(parse_result(&mut buf)?),
            OpCode::Error => Response::Error(parse_error(&mut buf)?),
            OpCode::Event => Response::Event(parse_event(&mut buf)?),
            other => {
                return Err(Error::Parse(format!(
                    "opcode {other:?} is not a response"
                )))
            }
        })
    }
}

fn parse_result(buf: &mut Bytes) -> Result<QueryResult> {
    need(buf, 4)?;
    Ok(match buf.get_i32() {
        0x0001 => QueryResult::Void,
        0x0002 => QueryResult::Rows(parse_rows(buf)?),
        0x0003 => QueryResult::SetKeyspace(get_string(buf)?),
        0x0004 => QueryResult::Prepared(Prepared {
            // prepared metadata follows the id; nothing in it is used
            id: QueryId(get_short_bytes(buf)?),
        }),
        0x0005 => QueryResult::SchemaChange,
        kind => return Err(Error::Parse(format!("unknown result kind 0x{kind:04x}"))),
    })
}

const ROWS_FLAG_GLOBAL_TABLE_SPEC: i32 = 0x0001;
const ROWS_FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const ROWS_FLAG_NO_METADATA: i32 = 0x0004;

fn parse_rows(buf: &mut Bytes) -> Result<Rows> {
    need(buf, 8)?;
    let flags = buf.get_i32();
    let column_count = buf.get_i32();
    if column_count < 0 {
        return Err(Error::Parse("negative column count".into()));
    }

    if flags & ROWS_FLAG_HAS_MORE_PAGES != 0 {
        let _paging_state = get_bytes(buf)?;
    }

    let mut columns = Vec::new();
    if flags & ROWS_FLAG_NO_METADATA == 0 {
        let global = if flags & ROWS_FLAG_GLOBAL_TABLE_SPEC != 0 {
            Some((get_string(buf)?, get_string(buf)?))
        } else {
            None
        };
        for _ in 0..column_count {
            let (keyspace, table) = match &global {
                Some((ks, t)) => (ks.clone(), t.clone()),
                None => (get_string(buf)?, get_string(buf)?),
            };
            let name = get_string(buf)?;
            skip_type(buf)?;
            columns.push(Column {
                keyspace,
                table,
                name,
            });
        }
    }

    need(buf, 4)?;
    let row_count = buf.get_i32();
    if row_count < 0 {
        return Err(Error::Parse("negative row count".into()));
    }
    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        let mut row = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            row.push(get_bytes(buf)?);
        }
        rows.push(row);
    }
    Ok(Rows { columns, rows })
}

/// Consumes one column type description (the `option` production).
fn skip_type(buf: &mut Bytes) -> Result<()> {
    need(buf, 2)?;
    match buf.get_u16() {
        0x0000 => {
            let _class = get_string(buf)?;
        }
        0x0020 | 0x0022 => skip_type(buf)?, // list, set
        0x0021 => {
            // map
            skip_type(buf)?;
            skip_type(buf)?;
        }
        0x0030 => {
            // udt: keyspace, name, n fields of (name, type)
            let _ks = get_string(buf)?;
            let _name = get_string(buf)?;
            need(buf, 2)?;
            let n = buf.get_u16();
            for _ in 0..n {
                let _field = get_string(buf)?;
                skip_type(buf)?;
            }
        }
        0x0031 => {
            // tuple
            need(buf, 2)?;
            let n = buf.get_u16();
            for _ in 0..n {
                skip_type(buf)?;
            }
        }
        _primitive => {}
    }
    Ok(())
}

fn parse_error(buf: &mut Bytes) -> Result<DbError> {
    need(buf, 4)?;
    let code = buf.get_i32();
    let message = get_string(buf)?;
    let kind = match code {
        0x0000 => DbErrorKind::ServerError,
        0x000A => DbErrorKind::ProtocolError,
        0x0100 => DbErrorKind::AuthenticationError,
        0x1000 => {
            need(buf, 2)?;
            DbErrorKind::Unavailable {
                consistency: Consistency::from_u16(buf.get_u16())?,
                required: get_i32(buf)?,
                alive: get_i32(buf)?,
            }
        }
        0x1001 => DbErrorKind::Overloaded,
        0x1002 => DbErrorKind::IsBootstrapping,
        0x1003 => DbErrorKind::TruncateError,
        0x1100 => {
            need(buf, 2)?;
            DbErrorKind::WriteTimeout {
                consistency: Consistency::from_u16(buf.get_u16())?,
                received: get_i32(buf)?,
                required: get_i32(buf)?,
                write_type: get_string(buf)?,
            }
        }
        0x1200 => {
            need(buf, 2)?;
            DbErrorKind::ReadTimeout {
                consistency: Consistency::from_u16(buf.get_u16())?,
                received: get_i32(buf)?,
                required: get_i32(buf)?,
                data_present: get_u8(buf)? != 0,
            }
        }
        0x1300 => DbErrorKind::ReadFailure,
        0x1400 => DbErrorKind::FunctionFailure,
        0x1500 => DbErrorKind::WriteFailure,
        0x2000 => DbErrorKind::SyntaxError,
        0x2100 => DbErrorKind::Unauthorized,
        0x2200 => DbErrorKind::Invalid,
        0x2300 => DbErrorKind::ConfigError,
        0x2400 => DbErrorKind::AlreadyExists {
            keyspace: get_string(buf)?,
            table: get_string(buf)?,
        },
        0x2500 => DbErrorKind::Unprepared {
            id: QueryId(get_short_bytes(buf)?),
        },
        other => DbErrorKind::Other(other),
    };
    Ok(DbError {
        kind,
        code,
        message,
    })
}

fn parse_event(buf: &mut Bytes) -> Result<Event> {
    let class = get_string(buf)?;
    Ok(match class.as_str() {
        "TOPOLOGY_CHANGE" => {
            let change = match get_string(buf)?.as_str() {
                "NEW_NODE" => TopologyChange::NewNode,
                "REMOVED_NODE" => TopologyChange::RemovedNode,
                "MOVED_NODE" => TopologyChange::MovedNode,
                other => {
                    return Err(Error::Parse(format!("unknown topology change {other:?}")))
                }
            };
            Event::Topology {
                change,
                addr: get_inet(buf)?,
            }
        }
        "STATUS_CHANGE" => {
            let change = match get_string(buf)?.as_str() {
                "UP" => StatusChange::Up,
                "DOWN" => StatusChange::Down,
                other => return Err(Error::Parse(format!("unknown status change {other:?}"))),
            };
            Event::Status {
                change,
                addr: get_inet(buf)?,
            }
        }
        "SCHEMA_CHANGE" => Event::Schema,
        other => return Err(Error::Parse(format!("unknown event class {other:?}"))),
    })
}

/// Reads a UTF-8 cell produced by a varchar / text column.
pub fn cell_text(cell: &Option<Bytes>) -> Result<String> {
    match cell {
        Some(bytes) => String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Parse("cell is not valid utf-8".into())),
        None => Err(Error::Parse("unexpected null cell".into())),
    }
}

/// Reads an IP address cell produced by an inet column.
pub fn cell_inet(cell: &Option<Bytes>) -> Result<IpAddr> {
    match cell.as_deref() {
        Some(b) if b.len() == 4 => {
            Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
        }
        Some(b) if b.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        Some(b) => Err(Error::Parse(format!("inet cell of {} bytes", b.len()))),
        None => Err(Error::Parse("unexpected null inet cell".into())),
    }
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(Error::Parse("truncated frame body".into()))
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    need(buf, 2)?;
    let n = buf.get_u16() as usize;
    need(buf, n)?;
    let raw = buf.split_to(n);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Parse("string is not valid utf-8".into()))
}

fn get_string_list(buf: &mut Bytes) -> Result<Vec<String>> {
    need(buf, 2)?;
    let n = buf.get_u16() as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(get_string(buf)?);
    }
    Ok(out)
}

fn get_string_multimap(buf: &mut Bytes) -> Result<HashMap<String, Vec<String>>> {
    need(buf, 2)?;
    let n = buf.get_u16() as usize;
    let mut out = HashMap::with_capacity(n);
    for _ in 0..n {
        let key = get_string(buf)?;
        let values = get_string_list(buf)?;
        out.insert(key, values);
    }
    Ok(out)
}

/// `[bytes]`: signed 32-bit length, negative encodes null.
fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    need(buf, 4)?;
    let n = buf.get_i32();
    if n < 0 {
        return Ok(None);
    }
    let n = n as usize;
    need(buf, n)?;
    Ok(Some(buf.split_to(n)))
}

fn get_short_bytes(buf: &mut Bytes) -> Result<Bytes> {
    need(buf, 2)?;
    let n = buf.get_u16() as usize;
    need(buf, n)?;
    Ok(buf.split_to(n))
}

fn get_inet(buf: &mut Bytes) -> Result<SocketAddr> {
    let n = get_u8(buf)? as usize;
    let ip = match n {
        4 => {
            need(buf, 4)?;
            let raw = buf.split_to(4);
            IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
        }
        16 => {
            need(buf, 16)?;
            let raw = buf.split_to(16);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(Error::Parse(format!("inet address of {other} bytes"))),
    };
    let port = get_i32(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn string(dst: &mut BytesMut, s: &str) {
        dst.put_u16(s.len() as u16);
        dst.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn parses_ready_and_authenticate() {
        assert!(matches!(
            Response::parse(OpCode::Ready, Bytes::new()).unwrap(),
            Response::Ready
        ));

        let mut body = BytesMut::new();
        string(&mut body, "org.apache.cassandra.auth.PasswordAuthenticator");
        match Response::parse(OpCode::Authenticate, body.freeze()).unwrap() {
            Response::Authenticate { mechanism } => {
                assert!(mechanism.ends_with("PasswordAuthenticator"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_rows_with_global_table_spec() {
        let mut body = BytesMut::new();
        body.put_i32(0x0002); // rows
        body.put_i32(ROWS_FLAG_GLOBAL_TABLE_SPEC);
        body.put_i32(2); // columns
        string(&mut body, "system");
        string(&mut body, "local");
        string(&mut body, "data_center");
        body.put_u16(0x000D); // varchar
        string(&mut body, "rack");
        body.put_u16(0x000D);
        body.put_i32(1); // one row
        body.put_i32(3);
        body.extend_from_slice(b"dc1");
        body.put_i32(2);
        body.extend_from_slice(b"r1");

        match Response::parse(OpCode::Result, body.freeze()).unwrap() {
            Response::Result(QueryResult::Rows(rows)) => {
                assert_eq!(rows.columns.len(), 2);
                assert_eq!(rows.columns[0].name, "data_center");
                assert_eq!(rows.rows.len(), 1);
                assert_eq!(cell_text(&rows.rows[0][0]).unwrap(), "dc1");
                assert_eq!(cell_text(&rows.rows[0][1]).unwrap(), "r1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_unprepared_error() {
        let mut body = BytesMut::new();
        body.put_i32(0x2500);
        string(&mut body, "Prepared query with ID 0xabcd not found");
        body.put_u16(2);
        body.extend_from_slice(&[0xAB, 0xCD]);

        match Response::parse(OpCode::Error, body.freeze()).unwrap() {
            Response::Error(db) => {
                assert!(!db.is_retryable());
                match db.kind {
                    DbErrorKind::Unprepared { id } => {
                        assert_eq!(&id.0[..], &[0xAB, 0xCD])
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retryable_kinds() {
        let overloaded = DbError {
            kind: DbErrorKind::Overloaded,
            code: 0x1001,
            message: "coordinator overloaded".into(),
        };
        let syntax = DbError {
            kind: DbErrorKind::SyntaxError,
            code: 0x2000,
            message: "bad query".into(),
        };
        assert!(overloaded.is_retryable());
        assert!(!syntax.is_retryable());
    }

    #[test]
    fn parses_status_event() {
        let mut body = BytesMut::new();
        string(&mut body, "STATUS_CHANGE");
        string(&mut body, "DOWN");
        body.put_u8(4);
        body.extend_from_slice(&[10, 0, 0, 7]);
        body.put_i32(9042);

        match Response::parse(OpCode::Event, body.freeze()).unwrap() {
            Response::Event(Event::Status { change, addr }) => {
                assert_eq!(change, StatusChange::Down);
                assert_eq!(addr, "10.0.0.7:9042".parse().unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn inet_cells_decode_both_families() {
        let v4 = Some(Bytes::from_static(&[192, 168, 1, 1]));
        assert_eq!(cell_inet(&v4).unwrap(), IpAddr::from([192, 168, 1, 1]));
        let v6 = Some(Bytes::from_static(&[0u8; 16]));
        assert!(matches!(cell_inet(&v6).unwrap(), IpAddr::V6(_)));
        assert!(cell_inet(&None).is_err());
    }
}
