//! Test helpers for integration tests
//!
//! A scripted PostgreSQL backend and a minimal frontend, enough to drive
//! the pooler end to end over real sockets.

#![allow(dead_code)]

use bytes::{Buf, Bytes, BytesMut};
use pgmux::Pooler;
use pgmux::config::Config;
use pgmux::constants::startup::CANCEL_REQUEST;
use pgmux::protocol::{backend, codec, status};
use pgmux::relay::Framer;
use pgmux::router::PoolSnapshot;
use pgmux::types::CancelKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

/// Generous bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Handle on a running mock backend
#[derive(Clone)]
pub struct MockBackend {
    pub port: u16,
    /// Startup handshakes accepted so far
    pub connections: Arc<AtomicUsize>,
    /// Cancel requests that matched a live backend
    pub cancels: Arc<AtomicUsize>,
    /// Signalled when a `select pg_sleep(..)` starts waiting
    pub sleeping: Arc<Notify>,
}

#[derive(Default)]
struct Shared {
    /// pid -> notify used to interrupt a sleeping query
    sleepers: Mutex<HashMap<i32, Arc<Notify>>>,
}

/// Spawn a mock backend on an ephemeral port
///
/// Every connection gets its own pid, counted from 1. Queries:
/// - `begin` / `commit` / `rollback` switch the transaction status
/// - `select pg_backend_pid()` returns one row with the pid
/// - `select pg_sleep(..)` blocks until cancelled, then fails with 57014
/// - anything else completes with no rows
pub async fn spawn_mock_backend() -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mock = MockBackend {
        port: listener.local_addr().unwrap().port(),
        connections: Arc::new(AtomicUsize::new(0)),
        cancels: Arc::new(AtomicUsize::new(0)),
        sleeping: Arc::new(Notify::new()),
    };
    let shared = Arc::new(Shared::default());
    let pids = Arc::new(AtomicI32::new(1));

    let handle = mock.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mock = handle.clone();
            let shared = shared.clone();
            let pids = pids.clone();
            tokio::spawn(async move {
                let _ = serve_backend(stream, mock, shared, pids).await;
            });
        }
    });
    mock
}

async fn serve_backend(
    mut stream: TcpStream,
    mock: MockBackend,
    shared: Arc<Shared>,
    pids: Arc<AtomicI32>,
) -> std::io::Result<()> {
    let len = stream.read_i32().await? as usize;
    let mut packet = vec![0u8; len - 4];
    stream.read_exact(&mut packet).await?;
    let mut body = &packet[..];
    let code = body.get_i32();

    if code == CANCEL_REQUEST {
        let pid = body.get_i32();
        let sleeper = shared.sleepers.lock().unwrap().get(&pid).cloned();
        if let Some(sleeper) = sleeper {
            mock.cancels.fetch_add(1, Ordering::SeqCst);
            sleeper.notify_one();
        }
        return Ok(());
    }

    let pid = pids.fetch_add(1, Ordering::SeqCst);
    mock.connections.fetch_add(1, Ordering::SeqCst);
    let wake = Arc::new(Notify::new());
    shared.sleepers.lock().unwrap().insert(pid, wake.clone());

    let mut out = BytesMut::new();
    codec::auth_ok(&mut out);
    codec::parameter_status(&mut out, "server_version", "16.0");
    codec::parameter_status(&mut out, "client_encoding", "UTF8");
    codec::backend_key_data(&mut out, CancelKey::new(pid, pid * 1000));
    codec::ready_for_query(&mut out, status::IDLE);
    stream.write_all(&out).await?;

    let mut framer = Framer::new(1024);
    let mut tx = status::IDLE;
    loop {
        let Ok(msg) = framer.read_frame(&mut stream).await else {
            break;
        };
        out.clear();
        match msg[0] {
            b'X' => break,
            b'Q' => {
                let sql = codec::parse_query(codec::body(&msg))
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                if sql.starts_with("begin") {
                    tx = status::IN_TRANSACTION;
                    codec::command_complete(&mut out, "BEGIN");
                } else if sql.starts_with("commit") || sql.starts_with("rollback") {
                    tx = status::IDLE;
                    codec::command_complete(&mut out, "COMMIT");
                } else if sql.starts_with("select pg_backend_pid") {
                    codec::row_description(&mut out, &["pg_backend_pid"]);
                    codec::data_row(&mut out, &[Some(&pid.to_string())]);
                    codec::command_complete(&mut out, "SELECT 1");
                } else if sql.starts_with("select pg_sleep") {
                    let interrupted = wake.notified();
                    mock.sleeping.notify_one();
                    interrupted.await;
                    codec::error_response(
                        &mut out,
                        "ERROR",
                        "57014",
                        "canceling statement due to user request",
                    );
                } else {
                    codec::command_complete(&mut out, "SET");
                }
                codec::ready_for_query(&mut out, tx);
            }
            b'S' => codec::ready_for_query(&mut out, tx),
            _ => {}
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
    }
    shared.sleepers.lock().unwrap().remove(&pid);
    Ok(())
}

/// A pooler running in the background
pub struct RunningPooler {
    pub port: u16,
    pub router: pgmux::RouterHandle,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningPooler {
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(WAIT, &mut self.task).await;
    }
}

/// Start a pooler for `config` on an ephemeral port
pub async fn start_pooler(mut config: Config) -> RunningPooler {
    config.listen.port = 0;
    let pooler = Pooler::new(config);
    let listener = pooler.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = pooler.router().clone();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(pooler.serve(listener, async move {
        let _ = stopped.await;
    }));
    RunningPooler {
        port,
        router,
        stop: Some(stop),
        task,
    }
}

/// One message read from the pooler
pub type Message = (u8, Bytes);

/// Frontend side of a pooled connection
pub struct PgClient {
    stream: TcpStream,
    framer: Framer,
    /// Key from BackendKeyData, if the greeting carried one
    pub key: Option<CancelKey>,
}

impl PgClient {
    /// Connect and run the startup phase
    ///
    /// Returns the messages read up to (and including) the first
    /// ReadyForQuery or ErrorResponse.
    pub async fn connect(port: u16, database: &str, user: &str) -> (Self, Vec<Message>) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut out = BytesMut::new();
        codec::startup_message(&mut out, &[("user", user), ("database", database)]);
        stream.write_all(&out).await.unwrap();

        let mut client = Self {
            stream,
            framer: Framer::new(4096),
            key: None,
        };
        let messages = client.read_until_ready().await;
        for (tag, msg) in &messages {
            if *tag == backend::BACKEND_KEY_DATA {
                client.key = codec::parse_backend_key_data(codec::body(msg)).ok();
            }
        }
        (client, messages)
    }

    /// Read messages until ReadyForQuery, a fatal error or EOF
    pub async fn read_until_ready(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            let read = tokio::time::timeout(WAIT, self.framer.read_frame(&mut self.stream)).await;
            let Ok(Ok(msg)) = read else {
                return messages;
            };
            let tag = msg[0];
            messages.push((tag, msg));
            if tag == backend::READY_FOR_QUERY {
                return messages;
            }
        }
    }

    pub async fn send_query(&mut self, sql: &str) {
        let mut out = BytesMut::new();
        codec::query(&mut out, sql);
        self.stream.write_all(&out).await.unwrap();
    }

    /// Simple query round trip
    pub async fn query(&mut self, sql: &str) -> Vec<Message> {
        self.send_query(sql).await;
        self.read_until_ready().await
    }

    /// Backend pid as reported by the mock backend
    pub async fn backend_pid(&mut self) -> i32 {
        let messages = self.query("select pg_backend_pid()").await;
        first_value(&messages)
            .and_then(|v| v.parse().ok())
            .expect("pid row")
    }

    pub async fn terminate(mut self) {
        let mut out = BytesMut::new();
        codec::terminate(&mut out);
        let _ = self.stream.write_all(&out).await;
        let _ = self.stream.shutdown().await;
    }
}

/// Tags of `messages`, as chars for readable assertions
pub fn tags(messages: &[Message]) -> String {
    messages.iter().map(|(tag, _)| *tag as char).collect()
}

/// First column of the first DataRow
pub fn first_value(messages: &[Message]) -> Option<String> {
    let (_, row) = messages.iter().find(|(tag, _)| *tag == backend::DATA_ROW)?;
    let mut body = codec::body(row);
    let _columns = body.get_i16();
    let len = body.get_i32();
    (len >= 0).then(|| String::from_utf8_lossy(&body[..len as usize]).into_owned())
}

/// SQLSTATE of the first ErrorResponse
pub fn error_code(messages: &[Message]) -> Option<String> {
    let (_, err) = messages.iter().find(|(tag, _)| *tag == backend::ERROR_RESPONSE)?;
    codec::parse_error_fields(codec::body(err)).ok().map(|f| f.code)
}

/// Send a CancelRequest for `key` on a fresh connection
pub async fn send_cancel(port: u16, key: CancelKey) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut out = BytesMut::new();
    codec::cancel_request(&mut out, key);
    stream.write_all(&out).await.unwrap();
    let _ = stream.shutdown().await;
}

/// Message text of the first ErrorResponse
pub fn error_message(messages: &[Message]) -> Option<String> {
    let (_, err) = messages.iter().find(|(tag, _)| *tag == backend::ERROR_RESPONSE)?;
    codec::parse_error_fields(codec::body(err)).ok().map(|f| f.message)
}

/// A local port with nothing listening on it
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll router snapshots until `check` holds
pub async fn wait_until(
    router: &pgmux::RouterHandle,
    check: impl Fn(&PoolSnapshot) -> bool,
) -> PoolSnapshot {
    tokio::time::timeout(WAIT, async {
        loop {
            let snap = router.snapshot().await;
            if check(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pool never reached the expected state")
}
