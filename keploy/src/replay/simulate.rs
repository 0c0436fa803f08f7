use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{KeployError, Result};
use crate::models::{HttpResp, TestCase};
use crate::parser::http::{complete_message, parse_response_bytes, synthesize_request};

/// Re-issue a recorded test case at the application and return its parsed
/// response. The whole round trip is bounded by `api_timeout`.
pub async fn simulate_http(
    case: &TestCase,
    app_port: u16,
    api_timeout: Duration,
) -> Result<HttpResp> {
    let port = target_port(case, app_port).ok_or_else(|| {
        KeployError::internal(format!(
            "test case {} has no target port (configure --port or record a Host header)",
            case.name
        ))
    })?;

    let round_trip = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let wire = synthesize_request(&case.spec.req);
        stream.write_all(&wire).await?;

        let mut resp_buf = Vec::new();
        complete_message(&mut stream, None, &mut resp_buf).await?;
        parse_response_bytes(&resp_buf)
    };

    debug!(
        event.name = "replay.simulate",
        test = %case.name,
        port = port,
        "re-issuing recorded request"
    );
    tokio::time::timeout(api_timeout, round_trip)
        .await
        .map_err(|_| {
            KeployError::internal(format!(
                "test case {} timed out after {:?}",
                case.name, api_timeout
            ))
        })?
}

/// The port to hit: the configured app port when set, otherwise whatever the
/// recorded Host header carried, otherwise plain http.
fn target_port(case: &TestCase, app_port: u16) -> Option<u16> {
    if app_port != 0 {
        return Some(app_port);
    }
    let host = &case.spec.req.host;
    if host.is_empty() {
        return None;
    }
    match host.rsplit_once(':') {
        Some((_, port)) => port.parse().ok(),
        None => Some(80),
    }
}
