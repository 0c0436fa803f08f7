use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::framing::{complete_message, has_expect_continue};
use super::{parse_request_bytes, synthesize_response};
use crate::error::{KeployError, Result};
use crate::proxy::demux::ParserCtx;
use crate::proxy::util::{passthrough, read_chunk_unbounded};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Replay-mode connection loop: frame each outgoing request the application
/// makes, answer it from the recorded mocks, and fall back to the real
/// destination when nothing matches.
///
/// On a miss the whole connection degrades to pass-through; the buffered
/// request is forwarded first so the upstream sees an unbroken stream.
pub(super) async fn replay_exchanges<C>(
    initial: Vec<u8>,
    client: &mut C,
    mut dest: Option<TcpStream>,
    ctx: &ParserCtx,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut req_buf = initial;

    loop {
        if has_expect_continue(&req_buf) {
            // no upstream involved: answer the interim response ourselves
            client.write_all(CONTINUE_RESPONSE).await?;
            let body_start = read_chunk_unbounded(client).await?;
            if body_start.is_empty() {
                return Err(KeployError::malformed(
                    "http",
                    "client closed after 100-continue",
                ));
            }
            req_buf.extend_from_slice(&body_start);
        }

        complete_message(client, None, &mut req_buf).await?;
        let request = match parse_request_bytes(&req_buf) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    event.name = "http.replay.demoted",
                    error.message = %e,
                    "request failed to parse, relaying remainder verbatim"
                );
                let mut upstream = match (dest.take(), ctx.dest_addr) {
                    (Some(upstream), _) => upstream,
                    (None, Some(addr)) => TcpStream::connect(addr).await?,
                    (None, None) => return Err(e),
                };
                passthrough(client, &mut upstream, &[req_buf]).await?;
                return Ok(());
            }
        };

        match ctx.mock_store.match_http(&request) {
            Some(mock) => {
                let wire = synthesize_response(&mock.spec.resp)?;
                client.write_all(&wire).await?;
                debug!(
                    event.name = "http.replay.mock_served",
                    mock.name = %mock.name,
                    url = %request.url,
                    "recorded response served"
                );
            }
            None => {
                if !ctx.is_bypassed_host(&request.host) {
                    warn!(
                        event.name = "http.replay.mock_miss",
                        host = %request.host,
                        url = %request.url,
                        "no recorded mock matched, passing through"
                    );
                }
                let mut upstream = match dest.take() {
                    Some(upstream) => upstream,
                    None => match ctx.dest_addr {
                        Some(addr) => TcpStream::connect(addr).await.map_err(|_| {
                            KeployError::MockMiss {
                                host: request.host.clone(),
                            }
                        })?,
                        None => {
                            return Err(KeployError::MockMiss {
                                host: request.host,
                            });
                        }
                    },
                };
                passthrough(client, &mut upstream, &[req_buf]).await?;
                return Ok(());
            }
        }

        req_buf = read_chunk_unbounded(client).await?;
        if req_buf.is_empty() {
            debug!(
                event.name = "http.replay.client_closed",
                "client closed the keep-alive chain"
            );
            return Ok(());
        }
    }
}
