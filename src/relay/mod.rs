//! The relay: steady-state forwarding between a client and its server
//!
//! Both directions are framed into whole messages (see [`Framer`]) and
//! forwarded as shared buffers without copying. The relay watches a few
//! message types to keep the server's protocol state current:
//!
//! - client `Query`, `Sync` and `FunctionCall` each expect one
//!   `ReadyForQuery`, counted in `sync_request`
//! - server `ReadyForQuery` carries the transaction status and settles one
//!   outstanding request
//! - server `CopyInResponse`/`CopyOutResponse`/`CopyBothResponse` enter copy
//!   mode
//! - server `ParameterStatus` updates both the server's and the client's
//!   parameter sets
//!
//! In transaction pooling the relay returns [`RelayOutcome::Released`] right
//! after forwarding a `ReadyForQuery` that leaves the server idle, with no
//! request outstanding and no extended-protocol messages waiting for a
//! `Sync`. It never releases in the middle of a pipeline.
//!
//! Reads and writes on both sides are driven from one `select!`, so a
//! server that answers each query before reading the next never stalls the
//! pair. Backpressure pauses only the side whose outbound queue is full.

pub mod buffer;
pub mod framer;

pub use buffer::BufferPool;
pub use framer::Framer;

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::IoSlice;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

use crate::backend::BackendConnection;
use crate::config::PoolMode;
use crate::error::RelayError;
use crate::protocol::{ParamSet, backend, codec, frontend, status};
use crate::route::RouteStats;
use crate::stream::AsyncStream;

/// Frames handed to one vectored write
const MAX_IOV: usize = 64;

/// Frontend half of a session as the relay sees it
#[derive(Debug)]
pub struct ClientSide<C> {
    pub io: C,
    pub framer: Framer,
    /// Parameters the client believes are in effect
    pub params: ParamSet,
}

impl<C: AsyncStream> ClientSide<C> {
    pub fn new(io: C, framer: Framer, params: ParamSet) -> Self {
        Self { io, framer, params }
    }

    /// Write raw protocol bytes and flush
    pub async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.io.write_all(data).await?;
        self.io.flush().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub pool: PoolMode,
    /// Queued outbound bytes at which the side feeding the queue stops
    /// being read
    pub pipeline_flush: usize,
}

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Transaction finished in transaction pooling; server may go back
    Released,
    /// Client sent Terminate
    Terminated,
    /// Killed from the console
    Killed,
}

/// Messages waiting to be written to one side
#[derive(Debug, Default)]
struct Outbound {
    frames: VecDeque<Bytes>,
    bytes: usize,
    /// Written since the last flush
    dirty: bool,
}

impl Outbound {
    fn push(&mut self, frame: Bytes) {
        self.bytes += frame.len();
        self.frames.push_back(frame);
    }

    /// Nothing queued and nothing left to flush
    fn is_idle(&self) -> bool {
        self.frames.is_empty() && !self.dirty
    }

    /// One write of as many queued frames as the socket takes, or the final
    /// flush once the queue is empty
    ///
    /// Cancel safe: state only changes after the write completes.
    async fn write_some<W: AsyncWrite + Unpin>(&mut self, io: &mut W) -> std::io::Result<()> {
        if self.frames.is_empty() {
            io.flush().await?;
            self.dirty = false;
            return Ok(());
        }
        let n = {
            let mut slices = [IoSlice::new(&[]); MAX_IOV];
            let mut count = 0;
            for (slot, frame) in slices.iter_mut().zip(self.frames.iter()) {
                *slot = IoSlice::new(frame);
                count += 1;
            }
            io.write_vectored(&slices[..count]).await?
        };
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        self.consume(n);
        self.dirty = true;
        Ok(())
    }

    fn consume(&mut self, mut n: usize) {
        self.bytes -= n;
        while n > 0 {
            let Some(front) = self.frames.front_mut() else { break };
            if n < front.len() {
                front.advance(n);
                break;
            }
            n -= front.len();
            self.frames.pop_front();
        }
    }
}

/// Per-pair relay state
struct Pair<'a, C, S> {
    client: &'a mut ClientSide<C>,
    server: &'a mut BackendConnection<S>,
    opts: RelayOptions,
    stats: &'a mut RouteStats,
    to_server: Outbound,
    to_client: Outbound,
    /// Extended-protocol messages forwarded since the last Sync
    unsynced: bool,
}

enum Step {
    Continue,
    Stop(RelayOutcome),
}

impl<C: AsyncStream, S: AsyncStream> Pair<'_, C, S> {
    fn on_client(&mut self, frame: Bytes) -> Step {
        let tag = frame[0];
        match tag {
            frontend::TERMINATE => return Step::Stop(RelayOutcome::Terminated),
            frontend::QUERY | frontend::SYNC | frontend::FUNCTION_CALL => {
                self.server.sync_request += 1;
                self.stats.queries += 1;
                self.unsynced = false;
            }
            frontend::COPY_DATA | frontend::COPY_DONE | frontend::COPY_FAIL => {}
            _ => self.unsynced = true,
        }
        trace!("client -> server '{}' ({} bytes)", tag as char, frame.len());
        self.stats.bytes_in += frame.len() as u64;
        self.to_server.push(frame);
        Step::Continue
    }

    fn on_server(&mut self, frame: Bytes) -> Result<Step, RelayError> {
        let tag = frame[0];
        let mut release = false;
        match tag {
            backend::READY_FOR_QUERY => {
                let tx_status =
                    codec::parse_ready_status(codec::body(&frame)).map_err(RelayError::ServerProtocol)?;
                self.server.on_ready(tx_status);
                if tx_status == status::IDLE {
                    self.stats.transactions += 1;
                }
                release = self.opts.pool.is_transaction()
                    && !self.server.is_transaction
                    && !self.server.is_copy
                    && self.server.is_synchronized()
                    && !self.unsynced;
            }
            backend::PARAMETER_STATUS => {
                let (name, value) = codec::parse_parameter_status(codec::body(&frame))
                    .map_err(RelayError::ServerProtocol)?;
                self.server.params_mut().set(&name, &value);
                self.client.params.set(&name, &value);
            }
            backend::COPY_IN_RESPONSE | backend::COPY_OUT_RESPONSE | backend::COPY_BOTH_RESPONSE => {
                self.server.is_copy = true;
            }
            _ => {}
        }
        trace!("server -> client '{}' ({} bytes)", tag as char, frame.len());
        self.stats.bytes_out += frame.len() as u64;
        self.to_client.push(frame);
        Ok(if release {
            Step::Stop(RelayOutcome::Released)
        } else {
            Step::Continue
        })
    }

    /// Queue every complete buffered message, client side first
    fn dispatch(&mut self) -> Result<Option<RelayOutcome>, RelayError> {
        while let Some(frame) = self
            .client
            .framer
            .next_frame()
            .map_err(RelayError::ClientProtocol)?
        {
            if let Step::Stop(outcome) = self.on_client(frame) {
                return Ok(Some(outcome));
            }
        }
        loop {
            let next = {
                let (_, framer) = self.server.parts();
                framer.next_frame().map_err(RelayError::ServerProtocol)?
            };
            let Some(frame) = next else { break };
            if let Step::Stop(outcome) = self.on_server(frame)? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    fn is_flushed(&self) -> bool {
        self.to_server.is_idle() && self.to_client.is_idle()
    }
}

/// Relay between `client` and `server` until release, terminate or kill
///
/// `first` is a client message already read by the caller (the one that
/// triggered the attach); it is forwarded before anything else.
pub async fn relay<C: AsyncStream, S: AsyncStream>(
    client: &mut ClientSide<C>,
    server: &mut BackendConnection<S>,
    first: Option<Bytes>,
    opts: RelayOptions,
    kill: &Notify,
    stats: &mut RouteStats,
) -> Result<RelayOutcome, RelayError> {
    let mut pair = Pair {
        client,
        server,
        opts,
        stats,
        to_server: Outbound::default(),
        to_client: Outbound::default(),
        unsynced: false,
    };

    let mut stop = None;
    if let Some(frame) = first
        && let Step::Stop(outcome) = pair.on_client(frame)
    {
        stop = Some(outcome);
    }

    loop {
        if stop.is_none() {
            stop = pair.dispatch()?;
        }
        if let Some(outcome) = stop
            && pair.is_flushed()
        {
            return Ok(outcome);
        }

        // A side is read only while the queue it feeds has room. Once the
        // relay is stopping, the server is still read so that it can take
        // the rest of its input; those replies stay in its framer.
        let limit = pair.opts.pipeline_flush;
        let read_client = stop.is_none() && pair.to_server.bytes < limit;
        let read_server = match stop {
            None => pair.to_client.bytes < limit,
            Some(_) => !pair.to_server.is_idle(),
        };

        let write_server = !pair.to_server.is_idle();
        let write_client = !pair.to_client.is_idle();

        let Pair {
            client,
            server,
            to_server,
            to_client,
            ..
        } = &mut pair;
        let (server_io, server_framer) = server.parts();
        let (mut server_rd, mut server_wr) = tokio::io::split(server_io);
        let (mut client_rd, mut client_wr) = tokio::io::split(&mut client.io);
        let client_framer = &mut client.framer;
        tokio::select! {
            read = client_framer.fill(&mut client_rd), if read_client => {
                read.map_err(RelayError::client_read)?;
            }
            read = server_framer.fill(&mut server_rd), if read_server => {
                read.map_err(RelayError::server_read)?;
            }
            written = to_server.write_some(&mut server_wr), if write_server => {
                written.map_err(RelayError::ServerWrite)?;
            }
            written = to_client.write_some(&mut client_wr), if write_client => {
                written.map_err(RelayError::ClientWrite)?;
            }
            _ = kill.notified() => {
                return Ok(RelayOutcome::Killed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{pair as server_pair, ready};
    use bytes::{BufMut, BytesMut};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};

    /// The pooler's view of one client/server pair
    struct Sides {
        client: ClientSide<DuplexStream>,
        server: BackendConnection<DuplexStream>,
        kill: Notify,
        stats: RouteStats,
    }

    impl Sides {
        async fn run(&mut self, pool: PoolMode, first: Option<Bytes>) -> Result<RelayOutcome, RelayError> {
            let opts = RelayOptions {
                pool,
                pipeline_flush: 4096,
            };
            tokio::time::timeout(
                Duration::from_secs(5),
                relay(&mut self.client, &mut self.server, first, opts, &self.kill, &mut self.stats),
            )
            .await
            .expect("relay stalled")
        }
    }

    /// Sides plus the test ends: the user's socket and the backend's socket
    fn setup() -> (Sides, DuplexStream, DuplexStream) {
        let (near, user) = tokio::io::duplex(256 * 1024);
        let (server, backend) = server_pair();
        let sides = Sides {
            client: ClientSide::new(near, Framer::new(1024), ParamSet::new()),
            server,
            kill: Notify::new(),
            stats: RouteStats::default(),
        };
        (sides, user, backend)
    }

    fn msg(tag: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(body);
        buf
    }

    fn query(sql: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        codec::query(&mut buf, sql);
        buf
    }

    fn result_rows(status_byte: u8) -> BytesMut {
        let mut buf = BytesMut::new();
        codec::row_description(&mut buf, &["n"]);
        codec::data_row(&mut buf, &[Some("1")]);
        codec::command_complete(&mut buf, "SELECT 1");
        codec::ready_for_query(&mut buf, status_byte);
        buf
    }

    /// Read one whole message as raw bytes
    async fn read_msg<R: AsyncRead + Unpin>(io: &mut R) -> BytesMut {
        let tag = io.read_u8().await.unwrap();
        let len = io.read_i32().await.unwrap();
        let mut body = vec![0; len as usize - 4];
        io.read_exact(&mut body).await.unwrap();
        msg(tag, &body)
    }

    async fn read_n(io: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut out = vec![0; n];
        io.read_exact(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_transaction_mode_releases_on_idle_ready() {
        let (mut sides, mut user, mut backend) = setup();
        let q = query("select 1");
        let reply = result_rows(status::IDLE);
        backend.write_all(&reply).await.unwrap();

        let outcome = sides
            .run(PoolMode::Transaction, Some(q.clone().freeze()))
            .await
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Released);
        assert!(sides.server.is_synchronized());
        assert!(!sides.server.is_transaction);

        assert_eq!(read_n(&mut backend, q.len()).await, q.to_vec());
        assert_eq!(read_n(&mut user, reply.len()).await, reply.to_vec());
        assert_eq!(sides.stats.queries, 1);
        assert_eq!(sides.stats.transactions, 1);
        assert_eq!(sides.stats.bytes_in, q.len() as u64);
        assert_eq!(sides.stats.bytes_out, reply.len() as u64);
    }

    #[tokio::test]
    async fn test_session_mode_runs_until_terminate() {
        let (mut sides, mut user, mut backend) = setup();
        backend.write_all(&result_rows(status::IDLE)).await.unwrap();

        let peer = tokio::spawn(async move {
            let reply = read_n(&mut user, result_rows(status::IDLE).len()).await;
            let mut terminate = BytesMut::new();
            codec::terminate(&mut terminate);
            user.write_all(&terminate).await.unwrap();
            (reply, user)
        });

        let outcome = sides
            .run(PoolMode::Session, Some(query("select 1").freeze()))
            .await
            .unwrap();
        let (reply, _user) = peer.await.unwrap();
        assert_eq!(outcome, RelayOutcome::Terminated);
        assert_eq!(reply, result_rows(status::IDLE).to_vec());
        assert!(sides.server.is_synchronized());

        // Terminate is not forwarded: the backend only ever saw the query
        let q = query("select 1");
        assert_eq!(read_n(&mut backend, q.len()).await, q.to_vec());
        let mut extra = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(20), backend.read(&mut extra))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_open_transaction_holds_server() {
        let (mut sides, mut user, mut backend) = setup();

        let server_peer = tokio::spawn(async move {
            read_msg(&mut backend).await;
            let mut reply = BytesMut::new();
            codec::command_complete(&mut reply, "BEGIN");
            codec::ready_for_query(&mut reply, status::IN_TRANSACTION);
            backend.write_all(&reply).await.unwrap();

            let commit = read_msg(&mut backend).await;
            let mut reply = BytesMut::new();
            codec::command_complete(&mut reply, "COMMIT");
            codec::ready_for_query(&mut reply, status::IDLE);
            backend.write_all(&reply).await.unwrap();
            (commit, backend)
        });
        let client_peer = tokio::spawn(async move {
            // wait for BEGIN's reply before committing
            read_msg(&mut user).await;
            let z = read_msg(&mut user).await;
            assert_eq!(z[0], backend::READY_FOR_QUERY);
            user.write_all(&query("commit")).await.unwrap();
            user
        });

        let outcome = sides
            .run(PoolMode::Transaction, Some(query("begin").freeze()))
            .await
            .unwrap();
        let (commit, _backend) = server_peer.await.unwrap();
        let _user = client_peer.await.unwrap();

        assert_eq!(outcome, RelayOutcome::Released);
        assert_eq!(commit, query("commit"));
        assert_eq!(sides.server.sync_request, 2);
        assert_eq!(sides.server.sync_reply, 2);
        assert_eq!(sides.stats.transactions, 1);
    }

    #[tokio::test]
    async fn test_pipelined_queries_release_after_last_reply() {
        let (mut sides, mut user, mut backend) = setup();
        let mut batch = query("select 1");
        batch.extend_from_slice(&query("select 2"));
        user.write_all(&batch).await.unwrap();

        let mut replies = result_rows(status::IDLE);
        replies.extend_from_slice(&result_rows(status::IDLE));
        backend.write_all(&replies).await.unwrap();

        let outcome = sides.run(PoolMode::Transaction, None).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Released);
        assert_eq!(sides.server.sync_request, 2);
        assert_eq!(sides.server.sync_reply, 2);
        assert_eq!(sides.stats.queries, 2);
        assert_eq!(read_n(&mut user, replies.len()).await, replies.to_vec());
    }

    #[tokio::test]
    async fn test_extended_protocol_releases_on_sync() {
        let (mut sides, mut user, mut backend) = setup();
        let mut batch = msg(frontend::PARSE, b"\0select 1\0\0\0");
        batch.extend_from_slice(&msg(frontend::BIND, b"\0\0\0\0\0\0\0\0"));
        batch.extend_from_slice(&msg(frontend::EXECUTE, b"\0\0\0\0\0"));
        batch.extend_from_slice(&msg(frontend::SYNC, b""));
        user.write_all(&batch).await.unwrap();

        let mut replies = msg(b'1', b"");
        replies.extend_from_slice(&msg(b'2', b""));
        codec::data_row(&mut replies, &[Some("1")]);
        codec::command_complete(&mut replies, "SELECT 1");
        replies.extend_from_slice(&ready(status::IDLE));
        backend.write_all(&replies).await.unwrap();

        let outcome = sides.run(PoolMode::Transaction, None).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Released);
        assert_eq!(sides.server.sync_request, 1);
        assert_eq!(read_n(&mut backend, batch.len()).await, batch.to_vec());
        assert_eq!(read_n(&mut user, replies.len()).await, replies.to_vec());
    }

    #[tokio::test]
    async fn test_no_release_with_unsynced_tail() {
        let (mut sides, mut user, mut backend) = setup();
        // a simple query followed by the start of an extended batch
        let mut first = query("select 1");
        first.extend_from_slice(&msg(frontend::PARSE, b"\0select 2\0\0\0"));
        user.write_all(&first).await.unwrap();

        let server_peer = tokio::spawn(async move {
            read_msg(&mut backend).await;
            read_msg(&mut backend).await;
            backend.write_all(&result_rows(status::IDLE)).await.unwrap();
            // the rest of the batch arrives only after the first reply
            read_msg(&mut backend).await;
            read_msg(&mut backend).await;
            let sync = read_msg(&mut backend).await;
            assert_eq!(sync[0], frontend::SYNC);
            let mut replies = msg(b'1', b"");
            replies.extend_from_slice(&msg(b'2', b""));
            codec::command_complete(&mut replies, "SELECT 1");
            replies.extend_from_slice(&ready(status::IDLE));
            backend.write_all(&replies).await.unwrap();
            backend
        });
        let client_peer = tokio::spawn(async move {
            read_n(&mut user, result_rows(status::IDLE).len()).await;
            let mut rest = msg(frontend::BIND, b"\0\0\0\0\0\0\0\0");
            rest.extend_from_slice(&msg(frontend::EXECUTE, b"\0\0\0\0\0"));
            rest.extend_from_slice(&msg(frontend::SYNC, b""));
            user.write_all(&rest).await.unwrap();
            user
        });

        let outcome = sides.run(PoolMode::Transaction, None).await.unwrap();
        let _backend = server_peer.await.unwrap();
        let _user = client_peer.await.unwrap();
        assert_eq!(outcome, RelayOutcome::Released);
        assert_eq!(sides.server.sync_request, 2);
        assert_eq!(sides.server.sync_reply, 2);
    }

    #[tokio::test]
    async fn test_copy_in_keeps_server_until_done() {
        let (mut sides, mut user, mut backend) = setup();

        let server_peer = tokio::spawn(async move {
            read_msg(&mut backend).await;
            backend
                .write_all(&msg(backend::COPY_IN_RESPONSE, b"\0\0\0"))
                .await
                .unwrap();
            let data = read_msg(&mut backend).await;
            let done = read_msg(&mut backend).await;
            let mut reply = BytesMut::new();
            codec::command_complete(&mut reply, "COPY 1");
            codec::ready_for_query(&mut reply, status::IDLE);
            backend.write_all(&reply).await.unwrap();
            (data, done, backend)
        });
        let client_peer = tokio::spawn(async move {
            let g = read_msg(&mut user).await;
            assert_eq!(g[0], backend::COPY_IN_RESPONSE);
            let mut rows = msg(frontend::COPY_DATA, b"1\n");
            rows.extend_from_slice(&msg(frontend::COPY_DONE, b""));
            user.write_all(&rows).await.unwrap();
            user
        });

        let outcome = sides
            .run(PoolMode::Transaction, Some(query("copy t from stdin").freeze()))
            .await
            .unwrap();
        let (data, done, _backend) = server_peer.await.unwrap();
        let _user = client_peer.await.unwrap();

        assert_eq!(outcome, RelayOutcome::Released);
        assert_eq!(data[0], frontend::COPY_DATA);
        assert_eq!(done[0], frontend::COPY_DONE);
        assert!(!sides.server.is_copy);
        assert_eq!(sides.stats.queries, 1);
    }

    #[tokio::test]
    async fn test_parameter_status_reaches_both_sides() {
        let (mut sides, _user, mut backend) = setup();
        let mut reply = BytesMut::new();
        codec::command_complete(&mut reply, "SET");
        codec::parameter_status(&mut reply, "TimeZone", "Asia/Tokyo");
        codec::ready_for_query(&mut reply, status::IDLE);
        backend.write_all(&reply).await.unwrap();

        let outcome = sides
            .run(PoolMode::Transaction, Some(query("set timezone='Asia/Tokyo'").freeze()))
            .await
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Released);
        assert_eq!(sides.server.params().get("TimeZone"), Some("Asia/Tokyo"));
        assert_eq!(sides.client.params.get("TimeZone"), Some("Asia/Tokyo"));
    }

    #[tokio::test]
    async fn test_large_result_passes_through() {
        let (mut sides, mut user, mut backend) = setup();
        let big = "x".repeat(40_000);
        let mut reply = BytesMut::new();
        codec::data_row(&mut reply, &[Some(big.as_str())]);
        codec::command_complete(&mut reply, "SELECT 1");
        codec::ready_for_query(&mut reply, status::IDLE);
        let expected = reply.clone();

        let server_peer = tokio::spawn(async move {
            read_msg(&mut backend).await;
            // dribble the reply in pieces larger than the read-ahead
            for chunk in reply.chunks(3000) {
                backend.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            backend
        });

        let outcome = sides
            .run(PoolMode::Transaction, Some(query("select big").freeze()))
            .await
            .unwrap();
        let _backend = server_peer.await.unwrap();
        assert_eq!(outcome, RelayOutcome::Released);
        assert_eq!(read_n(&mut user, expected.len()).await, expected.to_vec());
    }

    #[tokio::test]
    async fn test_long_pipeline_against_lockstep_server() {
        const QUERIES: usize = 200;
        let (mut sides, user, mut backend) = setup();
        let filler = "x".repeat(1000);
        let mut reply = BytesMut::new();
        codec::data_row(&mut reply, &[Some(filler.as_str())]);
        codec::command_complete(&mut reply, "SELECT 1");
        codec::ready_for_query(&mut reply, status::IDLE);

        // a real server reads one query, answers it, then reads the next
        let server_peer = tokio::spawn(async move {
            for _ in 0..QUERIES {
                let q = read_msg(&mut backend).await;
                assert_eq!(q[0], frontend::QUERY);
                backend.write_all(&reply).await.unwrap();
            }
            backend
        });

        let (mut user_rd, mut user_wr) = tokio::io::split(user);
        let writer = tokio::spawn(async move {
            let sql = format!("select '{filler}'");
            for _ in 0..QUERIES {
                user_wr.write_all(&query(&sql)).await.unwrap();
            }
            user_wr
        });
        let reader = tokio::spawn(async move {
            let mut ready = 0;
            while ready < QUERIES {
                if read_msg(&mut user_rd).await[0] == backend::READY_FOR_QUERY {
                    ready += 1;
                }
            }
            let mut user_wr = writer.await.unwrap();
            let mut terminate = BytesMut::new();
            codec::terminate(&mut terminate);
            user_wr.write_all(&terminate).await.unwrap();
            (user_rd, user_wr)
        });

        let outcome = sides.run(PoolMode::Session, None).await.unwrap();
        let _backend = server_peer.await.unwrap();
        let _user = reader.await.unwrap();
        assert_eq!(outcome, RelayOutcome::Terminated);
        assert_eq!(sides.stats.queries, QUERIES as u64);
        assert_eq!(sides.server.sync_reply, QUERIES as u64);
        assert!(sides.server.is_synchronized());
    }

    #[tokio::test]
    async fn test_kill_interrupts_relay() {
        let (mut sides, _user, _backend) = setup();
        sides.kill.notify_one();
        let outcome = sides.run(PoolMode::Session, None).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Killed);
    }

    #[tokio::test]
    async fn test_server_close_is_server_error() {
        let (mut sides, _user, backend) = setup();
        drop(backend);
        let err = sides
            .run(PoolMode::Transaction, Some(query("select 1").freeze()))
            .await
            .unwrap_err();
        assert!(!err.server_healthy());
    }

    #[tokio::test]
    async fn test_client_close_leaves_server_healthy() {
        let (mut sides, user, _backend) = setup();
        drop(user);
        let err = sides.run(PoolMode::Session, None).await.unwrap_err();
        assert!(err.server_healthy());
        assert!(err.is_client_disconnect());
    }

    #[tokio::test]
    async fn test_bad_client_length_is_protocol_error() {
        let (mut sides, mut user, _backend) = setup();
        user.write_all(b"Q\0\0\0\x01").await.unwrap();
        let err = sides.run(PoolMode::Session, None).await.unwrap_err();
        assert!(matches!(err, RelayError::ClientProtocol(_)));
        assert!(err.server_healthy());
    }
}
