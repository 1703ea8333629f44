//! Control connection state and peer discovery queries.

use std::sync::Arc;

use tracing::warn;

use crate::cluster::host::{Host, InetAddr};
use crate::error::{Error, Result};
use crate::frame::request::{QueryParams, Request};
use crate::frame::response::{cell_inet, cell_text, QueryResult, Response, Rows};
use crate::frame::Consistency;
use crate::net::connection::Connection;

/// Connection state of the control link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connected,
    Reconnecting,
}

/// The distinguished connection used for topology queries and server
/// event subscription. Exactly one per client; mutated only by the
/// cluster controller.
pub struct Control {
    pub state: ControlState,
    pub connection: Arc<Connection>,
}

pub(crate) const LOCAL_QUERY: &str = "SELECT data_center, rack FROM system.local";
pub(crate) const PEERS_QUERY: &str =
    "SELECT peer, rpc_address, data_center, rack FROM system.peers";

/// Queries `system.local` for the control node's own placement.
pub(crate) async fn local_host(conn: &Connection, addr: InetAddr) -> Result<Host> {
    let rows = query_rows(conn, LOCAL_QUERY).await?;
    let row = rows
        .rows
        .first()
        .ok_or_else(|| Error::Parse("system.local returned no rows".into()))?;
    if row.len() < 2 {
        return Err(Error::Parse("system.local row too short".into()));
    }
    Ok(Host::new(addr, cell_text(&row[0])?, cell_text(&row[1])?))
}

/// Queries `system.peers` for the remaining cluster members. The
/// advertised `rpc_address` is preferred; unset or wildcard addresses
/// fall back to the gossip `peer` address. Unusable rows are skipped.
pub(crate) async fn discover_peers(conn: &Connection, port: u16) -> Result<Vec<Host>> {
    let rows = query_rows(conn, PEERS_QUERY).await?;
    let mut peers = Vec::with_capacity(rows.rows.len());
    for row in &rows.rows {
        if row.len() < 4 {
            return Err(Error::Parse("system.peers row too short".into()));
        }
        let peer = match cell_inet(&row[0]) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "skipping peer with unusable address");
                continue;
            }
        };
        let ip = match cell_inet(&row[1]) {
            Ok(rpc) if !rpc.is_unspecified() => rpc,
            _ => peer,
        };
        let dc = cell_text(&row[2]).unwrap_or_default();
        let rack = cell_text(&row[3]).unwrap_or_default();
        peers.push(Host::new(InetAddr::new(ip, port), dc, rack));
    }
    Ok(peers)
}

async fn query_rows(conn: &Connection, text: &str) -> Result<Rows> {
    let req = Request::Query {
        text: text.into(),
        params: QueryParams::with_consistency(Consistency::One),
    };
    match conn.request(&req).await? {
        Response::Result(QueryResult::Rows(rows)) => Ok(rows),
        Response::Error(e) => Err(Error::Server(e)),
        _ => Err(Error::UnexpectedResponse(conn.host())),
    }
}
