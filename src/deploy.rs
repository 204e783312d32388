//! Session parameter deployment onto a reused backend
//!
//! A server that last served a different client may carry that client's
//! session settings. Before relaying, the parameters the new client expects
//! are applied with a batch of SET statements whose replies are consumed
//! here and never reach the client.

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::backend::BackendConnection;
use crate::constants::DEPLOYABLE_PARAMS;
use crate::error::DeployError;
use crate::formatting::quote_literal;
use crate::protocol::{ParamSet, backend, codec, status};
use crate::stream::AsyncStream;
use crate::types::ClientId;

/// Statements needed to move `current` to `target`
///
/// Only [`DEPLOYABLE_PARAMS`] are considered; everything else stays as the
/// backend has it.
#[must_use]
pub fn plan(current: &ParamSet, target: &ParamSet) -> Vec<String> {
    current
        .diff(target, DEPLOYABLE_PARAMS)
        .into_iter()
        .map(|(name, value)| format!("SET {}={}", name, quote_literal(value)))
        .collect()
}

/// Apply `target` to the server on behalf of `client`
///
/// Returns the number of statements sent. Nothing is sent when the server
/// last served this same client. With `discard`, a server coming from
/// another client first gets `DISCARD ALL` and every deployable parameter
/// is set again.
pub async fn deploy<S: AsyncStream>(
    conn: &mut BackendConnection<S>,
    client: ClientId,
    target: &ParamSet,
    discard: bool,
) -> Result<usize, DeployError> {
    if conn.last_client == Some(client) {
        return Ok(0);
    }

    let discarding = discard && conn.last_client.is_some();
    let statements = if discarding {
        plan(&ParamSet::new(), target)
    } else {
        plan(conn.params(), target)
    };

    let mut out = BytesMut::new();
    let mut syncs = 0;
    if discarding {
        // DISCARD ALL refuses to run inside the implicit transaction of a
        // multi-statement query, so it travels alone
        codec::query(&mut out, "DISCARD ALL");
        syncs += 1;
    }
    if !statements.is_empty() {
        codec::query(&mut out, &statements.join(";"));
        syncs += 1;
    }
    if syncs == 0 {
        conn.last_client = Some(client);
        return Ok(0);
    }

    debug!(
        "Server {} deploy for client {}: {}{}",
        conn.id().short(),
        client.short(),
        if discarding { "DISCARD ALL; " } else { "" },
        statements.join("; ")
    );
    conn.send(&out).await?;
    conn.deploy_sync = syncs;

    let mut failure = None;
    while conn.deploy_sync > 0 {
        let msg = conn.read_message().await?;
        let body = codec::body(&msg);
        match msg[0] {
            backend::PARAMETER_STATUS => {
                let (name, value) = codec::parse_parameter_status(body)?;
                conn.params_mut().set(&name, &value);
            }
            backend::READY_FOR_QUERY => {
                let tx_status = codec::parse_ready_status(body)?;
                conn.is_transaction = tx_status != status::IDLE;
                conn.deploy_sync -= 1;
            }
            backend::ERROR_RESPONSE => {
                let err = codec::parse_error_fields(body)?;
                warn!(
                    "Server {} deploy rejected ({}): {}",
                    conn.id().short(),
                    err.code,
                    err.message
                );
                failure.get_or_insert(err);
            }
            _ => {}
        }
    }

    if let Some(err) = failure {
        return Err(DeployError::Rejected {
            code: err.code,
            message: err.message,
        });
    }

    // not every parameter is reported back, so record what was set
    for name in DEPLOYABLE_PARAMS {
        if let Some(value) = target.get(name) {
            conn.params_mut().set(name, value);
        }
    }
    conn.last_client = Some(client);
    Ok(statements.len() + usize::from(discarding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{pair, ready};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn params(pairs: &[(&str, &str)]) -> ParamSet {
        pairs.iter().copied().collect()
    }

    async fn read_query(far: &mut DuplexStream) -> String {
        assert_eq!(far.read_u8().await.unwrap(), b'Q');
        let len = far.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        far.read_exact(&mut body).await.unwrap();
        body.pop();
        String::from_utf8(body).unwrap()
    }

    async fn nothing_sent(far: &mut DuplexStream) -> bool {
        let mut byte = [0u8; 1];
        tokio::time::timeout(Duration::from_millis(20), far.read(&mut byte))
            .await
            .is_err()
    }

    #[test]
    fn test_plan_only_deployable_differences() {
        let current = params(&[
            ("TimeZone", "UTC"),
            ("server_version", "16"),
            ("client_encoding", "UTF8"),
        ]);
        let target = params(&[
            ("TimeZone", "Europe/Berlin"),
            ("application_name", "it's"),
            ("server_version", "9"),
            ("client_encoding", "UTF8"),
        ]);
        assert_eq!(
            plan(&current, &target),
            vec![
                "SET TimeZone='Europe/Berlin'".to_string(),
                "SET application_name='it''s'".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_client_skips_round_trip() {
        let (mut conn, mut far) = pair();
        let client = ClientId::new();
        conn.last_client = Some(client);
        let sent = deploy(&mut conn, client, &params(&[("TimeZone", "UTC")]), true)
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert!(nothing_sent(&mut far).await);
    }

    #[tokio::test]
    async fn test_matching_params_skip_round_trip() {
        let (mut conn, mut far) = pair();
        conn.params_mut().set("TimeZone", "UTC");
        let client = ClientId::new();
        let sent = deploy(&mut conn, client, &params(&[("TimeZone", "UTC")]), true)
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert_eq!(conn.last_client, Some(client));
        assert!(nothing_sent(&mut far).await);
    }

    #[tokio::test]
    async fn test_deploy_swallows_replies() {
        let (mut conn, mut far) = pair();
        let client = ClientId::new();
        let server = tokio::spawn(async move {
            let sql = read_query(&mut far).await;
            let mut reply = BytesMut::new();
            codec::command_complete(&mut reply, "SET");
            codec::parameter_status(&mut reply, "application_name", "app");
            codec::command_complete(&mut reply, "SET");
            codec::ready_for_query(&mut reply, status::IDLE);
            far.write_all(&reply).await.unwrap();
            (sql, far)
        });

        let target = params(&[("application_name", "app"), ("search_path", "s1")]);
        let sent = deploy(&mut conn, client, &target, true).await.unwrap();
        let (sql, mut far) = server.await.unwrap();

        assert_eq!(sent, 2);
        assert_eq!(sql, "SET application_name='app';SET search_path='s1'");
        assert_eq!(conn.deploy_sync, 0);
        assert_eq!(conn.last_client, Some(client));
        assert_eq!(conn.params().get("search_path"), Some("s1"));

        // second deploy for the same client is free
        assert_eq!(deploy(&mut conn, client, &target, true).await.unwrap(), 0);
        assert!(nothing_sent(&mut far).await);
    }

    #[tokio::test]
    async fn test_discard_when_client_changes() {
        let (mut conn, mut far) = pair();
        conn.last_client = Some(ClientId::new());
        conn.params_mut().set("TimeZone", "UTC");
        let server = tokio::spawn(async move {
            let first = read_query(&mut far).await;
            let second = read_query(&mut far).await;
            let mut reply = BytesMut::new();
            codec::command_complete(&mut reply, "DISCARD ALL");
            codec::ready_for_query(&mut reply, status::IDLE);
            codec::command_complete(&mut reply, "SET");
            codec::ready_for_query(&mut reply, status::IDLE);
            far.write_all(&reply).await.unwrap();
            (first, second, far)
        });

        let sent = deploy(&mut conn, ClientId::new(), &params(&[("TimeZone", "UTC")]), true)
            .await
            .unwrap();
        let (first, second, _far) = server.await.unwrap();
        assert_eq!(sent, 2);
        assert_eq!(first, "DISCARD ALL");
        assert_eq!(second, "SET TimeZone='UTC'");
    }

    #[tokio::test]
    async fn test_rejected_deploy_drains_then_fails() {
        let (mut conn, mut far) = pair();
        let server = tokio::spawn(async move {
            read_query(&mut far).await;
            let mut reply = BytesMut::new();
            codec::error_response(&mut reply, "ERROR", "22023", "invalid value for parameter");
            reply.extend_from_slice(&ready(status::IDLE));
            far.write_all(&reply).await.unwrap();
            far
        });

        let err = deploy(&mut conn, ClientId::new(), &params(&[("TimeZone", "Mars")]), false)
            .await
            .unwrap_err();
        let _far = server.await.unwrap();
        match err {
            DeployError::Rejected { code, .. } => assert_eq!(code, "22023"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(conn.deploy_sync, 0);
        assert_eq!(conn.last_client, None);
    }

    #[tokio::test]
    async fn test_backend_gone_during_deploy() {
        let (mut conn, far) = pair();
        drop(far);
        let err = deploy(&mut conn, ClientId::new(), &params(&[("TimeZone", "UTC")]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Backend(_)));
    }
}
