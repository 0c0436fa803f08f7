//! End-to-end record -> persist -> replay cycles, driven through the mock
//! hook boundary and tempdir-backed YAML stores.

use std::sync::Arc;

use keploy_common::{
    ConnId, EVENT_BODY_MAX_SIZE, SockAddrIn, SocketDataEvent, SocketOpenEvent, TrafficDirection,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use keploy::core::Core;
use keploy::hooks::MockHooks;
use keploy::hooks::connection::ConnectionLedger;
use keploy::models::{ReportStatus, TestCase};
use keploy::platform::yaml::{YamlMockDb, YamlReportDb, YamlTestDb};
use keploy::platform::{ReportDb, TestDb};
use keploy::replay::Replayer;
use keploy::runtime::conf::Config;
use keploy::telemetry::NoopTelemetry;

fn data_event(
    conn_id: ConnId,
    direction: TrafficDirection,
    bytes: &[u8],
    validated: (u64, u64),
) -> SocketDataEvent {
    let mut msg = [0u8; EVENT_BODY_MAX_SIZE];
    msg[..bytes.len()].copy_from_slice(bytes);
    SocketDataEvent {
        timestamp_ns: 0,
        conn_id,
        direction,
        msg_size: bytes.len() as u32,
        validate_read_bytes: validated.0,
        validate_written_bytes: validated.1,
        msg,
    }
}

/// Capture one inbound exchange through the connection ledger, exactly as
/// the kernel event pump would feed it.
async fn capture_test_case(request: &[u8], response: &[u8]) -> TestCase {
    let (tx, mut rx) = mpsc::channel(8);
    let ledger = ConnectionLedger::new(tx, std::time::Duration::from_secs(4));
    let conn_id = ConnId {
        tgid: 100,
        fd: 7,
        opened_ns: 1,
    };

    ledger.handle_open(&SocketOpenEvent {
        timestamp_ns: 1,
        conn_id,
        addr: SockAddrIn::default(),
    });
    ledger.handle_data(&data_event(conn_id, TrafficDirection::Ingress, request, (0, 0)));
    ledger.handle_data(&data_event(
        conn_id,
        TrafficDirection::Egress,
        response,
        (request.len() as u64, 0),
    ));
    // a fresh request byte closes the exchange
    ledger.handle_data(&data_event(
        conn_id,
        TrafficDirection::Ingress,
        b"",
        (0, response.len() as u64),
    ));
    ledger.harvest().await;
    rx.try_recv().expect("captured test case")
}

/// App double answering every request with a fixed response.
async fn scripted_app(response: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut sink = vec![0u8; 4096];
                let Ok(n) = sock.read(&mut sink).await else {
                    return;
                };
                if n == 0 {
                    return;
                }
                let _ = sock.write_all(response).await;
            });
        }
    });
    port
}

fn replayer_for(config: Config, dir: &std::path::Path) -> Replayer {
    let hooks = Arc::new(MockHooks::new());
    let (incoming_tx, incoming_rx) = mpsc::channel(8);
    let ledger = Arc::new(ConnectionLedger::new(
        incoming_tx,
        config.keep_alive_idle_limit(),
    ));
    let core = Core::with_hooks(config.clone(), hooks.clone(), hooks, ledger, incoming_rx);
    Replayer::new(
        core,
        Arc::new(YamlTestDb::new(dir)),
        Arc::new(YamlMockDb::new(dir)),
        Arc::new(YamlReportDb::new(dir)),
        Arc::new(NoopTelemetry),
        config,
    )
}

fn base_config(dir: &std::path::Path, app_port: u16) -> Config {
    let mut config = Config::default();
    config.path = dir.to_path_buf();
    config.port = app_port as u32;
    config.proxy_port = 0;
    config.dns_port = 0;
    config.test.delay = 0;
    config
}

#[tokio::test]
async fn recorded_get_round_trip_passes_on_replay() {
    let dir = tempfile::tempdir().unwrap();

    // record: the app served GET /students with []
    let case = capture_test_case(
        b"GET /students HTTP/1.1\r\nHost: localhost:8080\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]",
    )
    .await;
    assert_eq!(case.spec.req.url, "/students");

    let test_db = YamlTestDb::new(dir.path());
    test_db.insert_test_case(&case, "test-set-0").await.unwrap();

    // replay: the app still answers [] (its data source is mocked away)
    let port = scripted_app(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]").await;
    let replayer = replayer_for(base_config(dir.path(), port), dir.path());
    assert!(replayer.start().await.unwrap());

    let report_db = YamlReportDb::new(dir.path());
    let report = report_db.get_report("test-run-0", "test-set-0").await.unwrap();
    assert_eq!(report.status, ReportStatus::Passed);
    assert_eq!(report.total, 1);
    assert_eq!(report.success, 1);
}

#[tokio::test]
async fn replay_is_idempotent_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let case = capture_test_case(
        b"GET /students HTTP/1.1\r\nHost: localhost:8080\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]",
    )
    .await;
    YamlTestDb::new(dir.path())
        .insert_test_case(&case, "test-set-0")
        .await
        .unwrap();

    let port = scripted_app(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]").await;
    let first = replayer_for(base_config(dir.path(), port), dir.path());
    assert!(first.start().await.unwrap());
    let second = replayer_for(base_config(dir.path(), port), dir.path());
    assert!(second.start().await.unwrap());

    let report_db = YamlReportDb::new(dir.path());
    let one = report_db.get_report("test-run-0", "test-set-0").await.unwrap();
    let two = report_db.get_report("test-run-1", "test-set-0").await.unwrap();
    assert_eq!(one.status, two.status);
    assert_eq!(one.total, two.total);
    assert_eq!(one.success, two.success);
    assert_eq!(one.failure, two.failure);
}

#[tokio::test]
async fn noise_masks_a_changed_date_header() {
    let dir = tempfile::tempdir().unwrap();
    let case = capture_test_case(
        b"GET /now HTTP/1.1\r\nHost: localhost:8080\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nDate: Mon, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;
    YamlTestDb::new(dir.path())
        .insert_test_case(&case, "test-set-0")
        .await
        .unwrap();

    let port = scripted_app(
        b"HTTP/1.1 200 OK\r\nDate: Tue, 02 Jan 2024 09:30:00 GMT\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;

    // without noise the Date mismatch fails the case
    let strict = replayer_for(base_config(dir.path(), port), dir.path());
    assert!(!strict.start().await.unwrap());

    // with header.Date configured as noise it passes
    let mut config = base_config(dir.path(), port);
    config
        .global_noise
        .global
        .insert("header.Date".to_string(), Vec::new());
    let masked = replayer_for(config, dir.path());
    assert!(masked.start().await.unwrap());
}

#[tokio::test]
async fn changed_response_body_fails_the_replay() {
    let dir = tempfile::tempdir().unwrap();
    let case = capture_test_case(
        b"GET /students HTTP/1.1\r\nHost: localhost:8080\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]",
    )
    .await;
    YamlTestDb::new(dir.path())
        .insert_test_case(&case, "test-set-0")
        .await
        .unwrap();

    let port = scripted_app(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n[1,2,3]").await;
    let replayer = replayer_for(base_config(dir.path(), port), dir.path());
    assert!(!replayer.start().await.unwrap());

    let report = YamlReportDb::new(dir.path())
        .get_report("test-run-0", "test-set-0")
        .await
        .unwrap();
    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.failure, 1);
    assert!(!report.tests[0].body_result.normal);
}
