//! HTTP/1.x parser: classification, wire capture, record relay, and replay
//! synthesis.

mod framing;
mod record;
mod replay;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::{KeployError, Result};
use crate::models::{HeaderMap, HttpReq, HttpResp, Kind, Mode};
use crate::proxy::demux::{ParserCtx, ProtocolParser};

pub use framing::{
    BodyFraming, CHUNK_READ_TIMEOUT, complete_message, decode_chunked, detect_framing, gunzip,
    gzip, has_complete_headers, header_end,
};

const METHOD_PREFIXES: [&[u8]; 7] = [
    b"GET ", b"POST ", b"PUT ", b"PATCH ", b"DELETE ", b"OPTIONS ", b"HEAD ",
];

pub struct HttpParser;

#[async_trait]
impl ProtocolParser for HttpParser {
    fn kind(&self) -> Kind {
        Kind::Http
    }

    fn outgoing_type(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(b"HTTP/")
            || METHOD_PREFIXES.iter().any(|m| prefix.starts_with(m))
    }

    async fn process_outgoing(
        &self,
        prefix: &[u8],
        mut client: TcpStream,
        dest: Option<TcpStream>,
        mode: Mode,
        ctx: ParserCtx,
    ) -> Result<()> {
        match mode {
            Mode::Record => {
                let mut dest = dest.ok_or_else(|| {
                    KeployError::internal("record mode requires an upstream connection")
                })?;
                record::record_exchanges(prefix.to_vec(), &mut client, &mut dest, &ctx).await
            }
            Mode::Test => replay::replay_exchanges(prefix.to_vec(), &mut client, dest, &ctx).await,
        }
    }
}

/// Parse a fully framed request into its structured shape. Chunked bodies
/// are stored decoded.
pub fn parse_request_bytes(raw: &[u8]) -> Result<HttpReq> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);
    let offset = match parsed.parse(raw) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(KeployError::malformed("http", "incomplete request headers"));
        }
        Err(e) => return Err(KeployError::malformed("http", format!("bad request: {e}"))),
    };

    let method = parsed
        .method
        .ok_or_else(|| KeployError::malformed("http", "request without method"))?
        .to_string();
    let url = parsed
        .path
        .ok_or_else(|| KeployError::malformed("http", "request without target"))?
        .to_string();
    let header = collect_headers(parsed.headers);
    let body = extract_body(&header, &raw[offset..])?;

    let url_params = url
        .split_once('?')
        .map(|(_, query)| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let host = header_first(&header, "Host").unwrap_or_default();

    Ok(HttpReq {
        method,
        proto_major: 1,
        proto_minor: parsed.version.unwrap_or(1),
        url,
        url_params,
        header,
        body,
        host,
    })
}

/// Parse a fully framed response into its structured shape.
///
/// Chunked bodies are stored decoded and gzip bodies decompressed, with
/// `Content-Length` recomputed on the stored representation so the artifact
/// is self-consistent.
pub fn parse_response_bytes(raw: &[u8]) -> Result<HttpResp> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);
    let offset = match parsed.parse(raw) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(KeployError::malformed("http", "incomplete response headers"));
        }
        Err(e) => return Err(KeployError::malformed("http", format!("bad response: {e}"))),
    };

    let status_code = parsed
        .code
        .ok_or_else(|| KeployError::malformed("http", "response without status"))?;
    let status_message = parsed.reason.unwrap_or_default().to_string();
    let mut header = collect_headers(parsed.headers);
    let mut body = extract_body(&header, &raw[offset..])?;

    if header_first(&header, "Content-Encoding").is_some_and(|v| v.eq_ignore_ascii_case("gzip")) {
        body = gunzip(&body).map_err(|e| {
            KeployError::malformed("http", format!("gzip body failed to decode: {e}"))
        })?;
    }

    remove_header(&mut header, "Transfer-Encoding");
    set_header(&mut header, "Content-Length", body.len().to_string());

    Ok(HttpResp {
        status_code,
        status_message,
        proto_major: 1,
        proto_minor: parsed.version.unwrap_or(1),
        header,
        body,
    })
}

/// Render a recorded response back to wire form. A recording that was gzip
/// encoded is re-gzipped, and `Content-Length` always matches the bytes that
/// actually follow the blank line.
pub fn synthesize_response(resp: &HttpResp) -> Result<Vec<u8>> {
    let body = if resp.is_gzipped() {
        gzip(&resp.body)
            .map_err(|e| KeployError::internal(format!("failed to gzip mock body: {e}")))?
    } else {
        resp.body.clone()
    };

    let reason = if resp.status_message.is_empty() {
        status_text(resp.status_code)
    } else {
        &resp.status_message
    };
    let mut wire = format!(
        "HTTP/{}.{} {} {}\r\n",
        resp.proto_major.max(1),
        resp.proto_minor,
        resp.status_code,
        reason
    )
    .into_bytes();

    let mut headers = resp.header.clone();
    set_header(&mut headers, "Content-Length", body.len().to_string());
    for (name, values) in &headers {
        for value in values {
            wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
    }
    wire.extend_from_slice(b"\r\n");
    wire.extend_from_slice(&body);
    Ok(wire)
}

/// Render a recorded request back to wire form (origin-form target), used
/// when test cases are re-issued at the application.
pub fn synthesize_request(req: &HttpReq) -> Vec<u8> {
    let target = if req.url.starts_with('/') {
        req.url.clone()
    } else {
        let query = req.url.split_once('?').map(|(_, q)| q);
        match query {
            Some(q) => format!("{}?{}", req.path(), q),
            None => req.path().to_string(),
        }
    };

    let mut wire = format!(
        "{} {} HTTP/{}.{}\r\n",
        req.method,
        target,
        req.proto_major.max(1),
        req.proto_minor
    )
    .into_bytes();

    let mut headers = req.header.clone();
    if !req.host.is_empty() && header_first(&headers, "Host").is_none() {
        set_header(&mut headers, "Host", req.host.clone());
    }
    if !req.body.is_empty() {
        set_header(&mut headers, "Content-Length", req.body.len().to_string());
    }
    remove_header(&mut headers, "Transfer-Encoding");
    for (name, values) in &headers {
        for value in values {
            wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
    }
    wire.extend_from_slice(b"\r\n");
    wire.extend_from_slice(&req.body);
    wire
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for h in parsed {
        let value = String::from_utf8_lossy(h.value).to_string();
        map.entry(h.name.to_string()).or_default().push(value);
    }
    map
}

fn header_first(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.first())
        .cloned()
}

fn remove_header(headers: &mut HeaderMap, name: &str) {
    headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
}

fn set_header(headers: &mut HeaderMap, name: &str, value: String) {
    let existing = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned();
    match existing {
        Some(key) => {
            headers.insert(key, vec![value]);
        }
        None => {
            headers.insert(name.to_string(), vec![value]);
        }
    }
}

fn extract_body(headers: &HeaderMap, rest: &[u8]) -> Result<Vec<u8>> {
    let is_chunked = header_first(headers, "Transfer-Encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    if is_chunked {
        let (body, complete) = decode_chunked(rest)?;
        if !complete {
            tracing::warn!(
                event.name = "http.body_truncated",
                "chunked body missing terminator, keeping decoded prefix"
            );
        }
        return Ok(body);
    }
    if let Some(length) = header_first(headers, "Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return Ok(rest[..length.min(rest.len())].to_vec());
    }
    Ok(rest.to_vec())
}

fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
