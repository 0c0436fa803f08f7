use std::io::{Read, Write};
use std::time::Duration;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{KeployError, Result};
use crate::proxy::util::read_chunk;

/// Per-chunk read deadline while framing a message body.
pub const CHUNK_READ_TIMEOUT: Duration = Duration::from_secs(5);

const HEADER_END: &[u8] = b"\r\n\r\n";
const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Index of the first byte after the header terminator, when present.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|i| i + HEADER_END.len())
}

pub fn has_complete_headers(buf: &[u8]) -> bool {
    header_end(buf).is_some()
}

/// Whether the request head carries `Expect: 100-continue`.
pub fn has_expect_continue(buf: &[u8]) -> bool {
    let head_len = header_end(buf).unwrap_or(buf.len());
    for line in buf[..head_len].split(|b| *b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("");
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("expect")
                && value.trim().eq_ignore_ascii_case("100-continue")
            {
                return true;
            }
        }
    }
    false
}

/// How the body of a message is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(usize),
    Chunked,
    None,
}

/// Scan the header section for `Content-Length` / `Transfer-Encoding`.
/// A non-numeric `Content-Length` is a fatal framing error.
pub fn detect_framing(head: &[u8]) -> Result<BodyFraming> {
    for line in head.split(|b| *b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("");
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| KeployError::malformed("http", "content-length is not a number"))?;
            return Ok(BodyFraming::ContentLength(length));
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.trim().eq_ignore_ascii_case("chunked")
        {
            return Ok(BodyFraming::Chunked);
        }
    }
    Ok(BodyFraming::None)
}

/// Read from `src` until `buf` holds one complete message (headers plus a
/// fully framed body), relaying every newly read chunk to `relay` as it
/// arrives so streaming behaviour is preserved end to end.
///
/// EOF before the body completes is tolerated for chunked bodies (recorded
/// with a warning) and for content-length bodies cut short by the peer; EOF
/// before the headers complete is a framing error.
pub async fn complete_message<R>(
    src: &mut R,
    mut relay: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    buf: &mut Vec<u8>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while !has_complete_headers(buf) {
        let chunk = read_chunk(src, CHUNK_READ_TIMEOUT).await?;
        if chunk.is_empty() {
            return Err(KeployError::malformed("http", "eof before headers completed"));
        }
        if let Some(w) = relay.as_deref_mut() {
            w.write_all(&chunk).await?;
        }
        buf.extend_from_slice(&chunk);
    }

    let head_len = header_end(buf).unwrap_or(buf.len());
    match detect_framing(&buf[..head_len])? {
        BodyFraming::None => {}
        BodyFraming::ContentLength(length) => {
            while buf.len() - head_len < length {
                let chunk = match read_chunk(src, CHUNK_READ_TIMEOUT).await {
                    Ok(chunk) => chunk,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        debug!(
                            event.name = "http.body_read_idle",
                            "stopped getting body data from the connection"
                        );
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };
                if chunk.is_empty() {
                    debug!(event.name = "http.body_eof", "peer closed before content-length");
                    break;
                }
                if let Some(w) = relay.as_deref_mut() {
                    w.write_all(&chunk).await?;
                }
                buf.extend_from_slice(&chunk);
            }
        }
        BodyFraming::Chunked => {
            while !buf.ends_with(CHUNK_TERMINATOR) {
                let chunk = match read_chunk(src, CHUNK_READ_TIMEOUT).await {
                    Ok(chunk) => chunk,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        debug!(
                            event.name = "http.chunk_read_idle",
                            "stopped getting chunked data from the connection"
                        );
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };
                if chunk.is_empty() {
                    warn!(
                        event.name = "http.chunked_truncated",
                        "chunked body ended without terminator before eof"
                    );
                    break;
                }
                if let Some(w) = relay.as_deref_mut() {
                    w.write_all(&chunk).await?;
                }
                buf.extend_from_slice(&chunk);
            }
        }
    }
    Ok(())
}

/// Decode a chunked transfer-coded body. Returns the decoded bytes and
/// whether the terminating zero-length chunk was seen.
pub fn decode_chunked(mut body: &[u8]) -> Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    loop {
        let Some(line_end) = body.windows(2).position(|w| w == b"\r\n") else {
            return Ok((out, false));
        };
        let size_line = std::str::from_utf8(&body[..line_end])
            .map_err(|_| KeployError::malformed("http", "chunk size line is not ascii"))?;
        let size_field = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| KeployError::malformed("http", "chunk size is not hexadecimal"))?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok((out, true));
        }
        if body.len() < size {
            // truncated mid-chunk; keep what arrived
            out.extend_from_slice(body);
            return Ok((out, false));
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size..];
        body = body.strip_prefix(b"\r\n").unwrap_or(body);
    }
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
