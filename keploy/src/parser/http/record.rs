use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::framing::{CHUNK_READ_TIMEOUT, complete_message, has_expect_continue};
use super::{parse_request_bytes, parse_response_bytes};
use crate::error::{KeployError, Result};
use crate::models::{Kind, Mock, MockSpec};
use crate::proxy::demux::ParserCtx;
use crate::proxy::util::{read_chunk, read_chunk_unbounded};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Record-mode connection loop: relay every byte between the application and
/// the real destination while capturing each exchange as a mock.
///
/// `initial` is the classification prefix, already read from the client but
/// not yet forwarded. The loop runs for the life of the keep-alive chain and
/// exits cleanly when either side closes between exchanges.
pub(super) async fn record_exchanges<C, D>(
    initial: Vec<u8>,
    client: &mut C,
    dest: &mut D,
    ctx: &ParserCtx,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    dest.write_all(&initial).await?;
    let mut req_buf = initial;

    loop {
        if has_expect_continue(&req_buf) {
            relay_continue(client, dest, &mut req_buf).await?;
        }

        let req_timestamp = Utc::now();
        complete_message(
            client,
            Some(&mut *dest as &mut (dyn AsyncWrite + Unpin + Send)),
            &mut req_buf,
        )
        .await?;

        let mut resp_buf = read_chunk_unbounded(dest).await?;
        if resp_buf.is_empty() {
            debug!(
                event.name = "http.record.server_closed",
                "destination closed before responding, ending connection loop"
            );
            return Ok(());
        }
        let res_timestamp = Utc::now();
        client.write_all(&resp_buf).await?;
        complete_message(
            dest,
            Some(&mut *client as &mut (dyn AsyncWrite + Unpin + Send)),
            &mut resp_buf,
        )
        .await?;

        if let Err(e) = emit_mock(&req_buf, &resp_buf, req_timestamp, res_timestamp, ctx).await {
            // the bytes were already relayed; demote the rest of the
            // connection to verbatim relay instead of killing it
            warn!(
                event.name = "http.record.demoted",
                error.message = %e,
                "exchange failed to parse, relaying remainder verbatim"
            );
            crate::proxy::util::passthrough(client, dest, &[]).await?;
            return Ok(());
        }

        req_buf = read_chunk_unbounded(client).await?;
        if req_buf.is_empty() {
            debug!(
                event.name = "http.record.client_closed",
                "client closed the keep-alive chain"
            );
            return Ok(());
        }
        dest.write_all(&req_buf).await?;
    }
}

/// `Expect: 100-continue`: relay the server's interim response, then pull
/// the request body the client was holding back. A server that answers with
/// anything else is reported as a malformed exchange.
async fn relay_continue<C, D>(client: &mut C, dest: &mut D, req_buf: &mut Vec<u8>) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    let interim = read_chunk(dest, CHUNK_READ_TIMEOUT).await.map_err(|e| {
        KeployError::malformed("http", format!("no response to expect 100-continue: {e}"))
    })?;
    if interim.is_empty() {
        return Err(KeployError::malformed(
            "http",
            "server closed instead of sending 100-continue",
        ));
    }
    client.write_all(&interim).await?;
    if interim != CONTINUE_RESPONSE {
        return Err(KeployError::malformed(
            "http",
            "expected 100-continue interim response was not sent by the server",
        ));
    }

    let body_start = read_chunk_unbounded(client).await?;
    if body_start.is_empty() {
        return Err(KeployError::malformed(
            "http",
            "client closed after 100-continue",
        ));
    }
    dest.write_all(&body_start).await?;
    req_buf.extend_from_slice(&body_start);
    Ok(())
}

async fn emit_mock(
    req_buf: &[u8],
    resp_buf: &[u8],
    req_timestamp: DateTime<Utc>,
    res_timestamp: DateTime<Utc>,
    ctx: &ParserCtx,
) -> Result<()> {
    let request = parse_request_bytes(req_buf)?;
    let response = parse_response_bytes(resp_buf)?;

    if ctx.is_bypassed_host(&request.host) {
        debug!(
            event.name = "http.record.bypassed_host",
            host = %request.host,
            "pass-through host, exchange not captured"
        );
        return Ok(());
    }

    let metadata = BTreeMap::from([
        ("name".to_string(), "Http".to_string()),
        ("type".to_string(), "HttpClient".to_string()),
        ("operation".to_string(), request.method.clone()),
    ]);
    let mock = Mock::new(
        Kind::Http,
        ctx.next_mock_name(),
        MockSpec {
            metadata,
            req: request,
            resp: response,
            req_timestamp_mock: req_timestamp,
            res_timestamp_mock: res_timestamp,
            created: Utc::now().timestamp(),
        },
    );

    if let Some(tx) = &ctx.mocks_tx {
        if tx.send(mock).await.is_err() {
            warn!(
                event.name = "http.record.outgoing_closed",
                "outgoing stream closed, dropping captured mock"
            );
        }
    }
    Ok(())
}
