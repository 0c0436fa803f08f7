use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Largest single read the proxy performs.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Read one chunk of whatever is available.
///
/// Returns an empty buffer on EOF and `ErrorKind::TimedOut` when `deadline`
/// passes without any bytes; callers treat the timeout as "the peer has
/// nothing more to say right now", mirroring the per-chunk read deadlines of
/// body framing.
pub async fn read_chunk<R>(stream: &mut R, deadline: Duration) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let n = tokio::time::timeout(deadline, stream.read(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline passed"))??;
    buf.truncate(n);
    Ok(buf)
}

/// Read one chunk with no deadline; used between keep-alive exchanges where
/// the peer may legitimately stay quiet for a long time. Cancellation comes
/// from the per-connection task being torn down.
pub async fn read_chunk_unbounded<R>(stream: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let n = stream.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Relay bytes unmodified in both directions until either side closes.
///
/// `buffered` holds request bytes already consumed from the client (the
/// classification prefix and anything framed before the decision to pass
/// through); they are written to the destination first.
pub async fn passthrough<C, D>(
    client: &mut C,
    dest: &mut D,
    buffered: &[Vec<u8>],
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    for chunk in buffered {
        dest.write_all(chunk).await?;
    }
    let copied = tokio::io::copy_bidirectional(client, dest).await?;
    debug!(
        event.name = "proxy.passthrough_closed",
        to_dest = copied.0,
        to_client = copied.1,
        "pass-through connection closed"
    );
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_chunk_returns_available_bytes() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"hello").await.unwrap();
        let chunk = read_chunk(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(chunk, b"hello");
    }

    #[tokio::test]
    async fn read_chunk_times_out_when_idle() {
        let (_a, mut b) = tokio::io::duplex(1024);
        let err = read_chunk(&mut b, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn read_chunk_signals_eof_with_empty_buffer() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let chunk = read_chunk(&mut b, Duration::from_secs(1)).await.unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn passthrough_relays_both_directions() {
        let (mut client, mut proxy_client_side) = tokio::io::duplex(1024);
        let (mut proxy_dest_side, mut dest) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            passthrough(
                &mut proxy_client_side,
                &mut proxy_dest_side,
                &[b"PING\r\n".to_vec()],
            )
            .await
        });

        let mut seen = vec![0u8; 6];
        dest.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"PING\r\n");

        dest.write_all(b"PONG\r\n").await.unwrap();
        let mut answer = vec![0u8; 6];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"PONG\r\n");

        drop(client);
        drop(dest);
        relay.await.unwrap().unwrap();
    }
}
