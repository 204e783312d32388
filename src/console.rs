//! Admin console served in-process for routes on a `local` storage
//!
//! Clients connect to it like to any database and issue simple queries.
//! Answers are rendered from a router snapshot as text result sets.

use bytes::BytesMut;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::constants::sqlstate;
use crate::error::SessionError;
use crate::formatting::format_bytes;
use crate::protocol::{codec, frontend, status};
use crate::relay::ClientSide;
use crate::router::{PoolSnapshot, RouterHandle};
use crate::stream::AsyncStream;
use crate::types::ClientId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ShowPools,
    ShowClients,
    ShowServers,
    ShowRoutes,
    KillClient(String),
}

impl Command {
    /// Parse a console query; keywords are case-insensitive
    pub fn parse(sql: &str) -> Option<Self> {
        let sql = sql.trim().trim_end_matches(';').trim();
        let mut words = sql.split_whitespace();
        let first = words.next()?.to_ascii_lowercase();
        let second = words.next();
        let rest = words.next();
        if rest.is_some() {
            return None;
        }
        match (first.as_str(), second.map(str::to_ascii_lowercase).as_deref()) {
            ("show", Some("pools")) => Some(Self::ShowPools),
            ("show", Some("clients")) => Some(Self::ShowClients),
            ("show", Some("servers")) => Some(Self::ShowServers),
            ("show", Some("routes")) => Some(Self::ShowRoutes),
            ("kill_client", Some(_)) => second.map(|id| Self::KillClient(id.to_string())),
            _ => None,
        }
    }
}

/// Text result set
#[derive(Debug, Default, PartialEq, Eq)]
struct Table {
    columns: &'static [&'static str],
    rows: Vec<Vec<String>>,
}

impl Table {
    fn encode(&self, out: &mut BytesMut, tag: &str) {
        codec::row_description(out, self.columns);
        for row in &self.rows {
            let values: Vec<Option<&str>> = row.iter().map(|v| Some(v.as_str())).collect();
            codec::data_row(out, &values);
        }
        codec::command_complete(out, &format!("{} {}", tag, self.rows.len()));
    }
}

fn pools(snap: &PoolSnapshot) -> Table {
    Table {
        columns: &[
            "database",
            "user",
            "pool_mode",
            "cl_pending",
            "cl_active",
            "cl_queued",
            "sv_idle",
            "sv_active",
        ],
        rows: snap
            .routes
            .iter()
            .map(|r| {
                vec![
                    r.database.clone(),
                    r.user.clone(),
                    r.pool.to_string(),
                    r.clients_pending.to_string(),
                    r.clients_active.to_string(),
                    r.clients_queued.to_string(),
                    r.servers_idle.to_string(),
                    r.servers_active.to_string(),
                ]
            })
            .collect(),
    }
}

fn clients(snap: &PoolSnapshot) -> Table {
    Table {
        columns: &["id", "database", "user", "state", "server"],
        rows: snap
            .clients
            .iter()
            .map(|c| {
                vec![
                    c.id.to_string(),
                    c.database.clone(),
                    c.user.clone(),
                    c.state.to_string(),
                    c.server.map(|s| s.short()).unwrap_or_default(),
                ]
            })
            .collect(),
    }
}

fn servers(snap: &PoolSnapshot) -> Table {
    Table {
        columns: &["id", "database", "user", "state", "client", "idle_ticks"],
        rows: snap
            .servers
            .iter()
            .map(|s| {
                vec![
                    s.id.to_string(),
                    s.database.clone(),
                    s.user.clone(),
                    s.state.to_string(),
                    s.client.map(|c| c.short()).unwrap_or_default(),
                    s.idle_time.to_string(),
                ]
            })
            .collect(),
    }
}

fn routes(snap: &PoolSnapshot) -> Table {
    Table {
        columns: &[
            "database",
            "user",
            "dynamic",
            "obsolete",
            "pool_size",
            "queries",
            "transactions",
            "bytes_in",
            "bytes_out",
        ],
        rows: snap
            .routes
            .iter()
            .map(|r| {
                vec![
                    r.database.clone(),
                    r.user.clone(),
                    r.dynamic.to_string(),
                    r.obsolete.to_string(),
                    r.pool_size.to_string(),
                    r.stats.queries.to_string(),
                    r.stats.transactions.to_string(),
                    format_bytes(r.stats.bytes_in),
                    format_bytes(r.stats.bytes_out),
                ]
            })
            .collect(),
    }
}

/// Run one console query, appending the reply (without ReadyForQuery)
pub async fn execute(router: &RouterHandle, sql: &str, out: &mut BytesMut) {
    let Some(command) = Command::parse(sql) else {
        codec::error_response(
            out,
            "ERROR",
            sqlstate::SYNTAX_ERROR,
            &format!("unsupported console command: {}", sql.trim()),
        );
        return;
    };
    debug!("Console: {:?}", command);
    match command {
        Command::ShowPools => pools(&router.snapshot().await).encode(out, "SHOW"),
        Command::ShowClients => clients(&router.snapshot().await).encode(out, "SHOW"),
        Command::ShowServers => servers(&router.snapshot().await).encode(out, "SHOW"),
        Command::ShowRoutes => routes(&router.snapshot().await).encode(out, "SHOW"),
        Command::KillClient(id) => {
            let killed = match ClientId::parse(&id) {
                Some(client) => router.kill(client).await,
                None => false,
            };
            if killed {
                info!("Console killed client {}", id);
                codec::command_complete(out, "KILL_CLIENT");
            } else {
                codec::error_response(
                    out,
                    "ERROR",
                    sqlstate::UNDEFINED_OBJECT,
                    &format!("client {id} not found"),
                );
            }
        }
    }
}

/// Serve a console session until the client leaves or is killed
///
/// Only simple queries are answered. Extended-protocol messages get one
/// error, the rest of the batch is skipped, and its Sync gets the
/// ReadyForQuery.
pub async fn serve<C: AsyncStream>(
    client: &mut ClientSide<C>,
    router: &RouterHandle,
    kill: &Notify,
) -> Result<(), SessionError> {
    let mut skipping = false;
    loop {
        let frame = tokio::select! {
            frame = client.framer.read_frame(&mut client.io) => {
                frame.map_err(SessionError::client_frame)?
            }
            _ = kill.notified() => return Err(SessionError::Killed),
        };

        let mut out = BytesMut::new();
        match frame[0] {
            frontend::TERMINATE => return Ok(()),
            frontend::QUERY => {
                let sql = codec::parse_query(codec::body(&frame))?;
                execute(router, sql, &mut out).await;
                codec::ready_for_query(&mut out, status::IDLE);
            }
            frontend::SYNC => {
                skipping = false;
                codec::ready_for_query(&mut out, status::IDLE);
            }
            _ if skipping => continue,
            other => {
                codec::error_response(
                    &mut out,
                    "ERROR",
                    sqlstate::PROTOCOL_VIOLATION,
                    &format!("console does not support message '{}'", other as char),
                );
                skipping = true;
            }
        }
        client.send(&out).await?;
    }
}
