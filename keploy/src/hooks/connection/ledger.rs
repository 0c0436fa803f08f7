use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use keploy_common::{ConnId, SocketCloseEvent, SocketDataEvent, SocketOpenEvent, TrafficDirection};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::tracker::{Exchange, Tracker};
use crate::models::{Kind, TestCase, TestCaseSpec};
use crate::parser::http;

/// How often idle trackers are swept for completed or abandoned exchanges.
const HARVEST_INTERVAL: Duration = Duration::from_secs(1);

/// Registry of live connection trackers, fed by the kernel socket events and
/// periodically harvested into the incoming test-case stream.
pub struct ConnectionLedger {
    trackers: DashMap<ConnId, Arc<Tracker>>,
    incoming_tx: mpsc::Sender<TestCase>,
    idle_limit: Duration,
    test_counter: AtomicU64,
}

impl ConnectionLedger {
    pub fn new(incoming_tx: mpsc::Sender<TestCase>, idle_limit: Duration) -> Self {
        Self {
            trackers: DashMap::new(),
            incoming_tx,
            idle_limit,
            test_counter: AtomicU64::new(1),
        }
    }

    fn tracker(&self, conn_id: ConnId) -> Arc<Tracker> {
        self.trackers
            .entry(conn_id)
            .or_insert_with(|| Arc::new(Tracker::new(conn_id)))
            .clone()
    }

    pub fn handle_open(&self, event: &SocketOpenEvent) {
        self.tracker(event.conn_id)
            .add_open_event(event.timestamp_ns, event.addr);
    }

    pub fn handle_data(&self, event: &SocketDataEvent) {
        // the validated counter that matters is the one for the side a
        // direction flip would close
        let validated = match event.direction {
            TrafficDirection::Egress => event.validate_read_bytes,
            TrafficDirection::Ingress => event.validate_written_bytes,
        };
        self.tracker(event.conn_id).add_data_event(
            event.direction,
            event.payload(),
            event.msg_size as u64,
            validated,
        );
    }

    pub fn handle_close(&self, event: &SocketCloseEvent) {
        if let Some(tracker) = self.trackers.get(&event.conn_id) {
            tracker.add_close_event(event.timestamp_ns);
        }
    }

    pub fn live_connections(&self) -> usize {
        self.trackers.len()
    }

    /// One sweep: emit every completed exchange as a test case and evict
    /// trackers that are closed or long inactive with nothing pending.
    pub async fn harvest(&self) {
        let trackers: Vec<Arc<Tracker>> =
            self.trackers.iter().map(|e| e.value().clone()).collect();

        for tracker in trackers {
            while let Some(exchange) = tracker.is_complete(self.idle_limit) {
                self.emit(&tracker, exchange).await;
            }

            let stale = tracker.is_closed()
                || tracker.is_inactive(self.idle_limit.saturating_mul(4));
            if stale && tracker.completed_exchanges() == 0 {
                self.trackers.remove(&tracker.conn_id());
            }
        }
    }

    /// Run the harvest loop until shutdown, then drain once more so the last
    /// exchanges of still-open connections are not lost.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(HARVEST_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => self.harvest().await,
                _ = shutdown_rx.recv() => {
                    self.harvest().await;
                    debug!(event.name = "ledger.stopped", "connection ledger stopped");
                    return;
                }
            }
        }
    }

    async fn emit(&self, tracker: &Tracker, exchange: Exchange) {
        let (request, response) = match (
            http::parse_request_bytes(&exchange.request),
            http::parse_response_bytes(&exchange.response),
        ) {
            (Ok(req), Ok(resp)) => (req, resp),
            (req, resp) => {
                debug!(
                    event.name = "ledger.unparsed_exchange",
                    conn.id = %tracker.conn_id(),
                    request_ok = req.is_ok(),
                    response_ok = resp.is_ok(),
                    "inbound exchange is not parseable http, skipping capture"
                );
                return;
            }
        };

        let seq = self.test_counter.fetch_add(1, Ordering::SeqCst);
        let case = TestCase::new(
            Kind::Http,
            format!("test-{seq}"),
            TestCaseSpec {
                req: request,
                resp: response,
                req_timestamp: exchange.req_timestamp,
                res_timestamp: exchange.res_timestamp,
                assertions: Default::default(),
                created: Utc::now().timestamp(),
            },
        );

        if self.incoming_tx.send(case).await.is_err() {
            warn!(
                event.name = "ledger.incoming_closed",
                "incoming stream closed, dropping captured test case"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use keploy_common::{EVENT_BODY_MAX_SIZE, SockAddrIn};

    use super::*;

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

    #[tokio::test]
    async fn harvest_emits_parsed_http_test_case() {
        let (tx, mut rx) = mpsc::channel(8);
        let ledger = ConnectionLedger::new(tx, Duration::from_secs(4));
        let conn_id = ConnId {
            tgid: 1,
            fd: 9,
            opened_ns: 7,
        };

        ledger.handle_open(&SocketOpenEvent {
            timestamp_ns: 7,
            conn_id,
            addr: SockAddrIn::default(),
        });

        let req = b"GET /students HTTP/1.1\r\nHost: localhost:8080\r\n\r\n";
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]";
        ledger.handle_data(&data_event(
            conn_id,
            TrafficDirection::Ingress,
            req,
            (0, 0),
        ));
        ledger.handle_data(&data_event(
            conn_id,
            TrafficDirection::Egress,
            resp,
            (req.len() as u64, 0),
        ));
        // next request on the same socket closes the first exchange
        ledger.handle_data(&data_event(
            conn_id,
            TrafficDirection::Ingress,
            b"GET /next HTTP/1.1\r\n\r\n",
            (0, resp.len() as u64),
        ));

        ledger.harvest().await;

        let case = rx.try_recv().expect("test case emitted");
        assert_eq!(case.kind, Kind::Http);
        assert_eq!(case.name, "test-1");
        assert_eq!(case.spec.req.method, "GET");
        assert_eq!(case.spec.req.url, "/students");
        assert_eq!(case.spec.resp.status_code, 200);
        assert_eq!(case.spec.resp.body, b"[]");
    }

    #[tokio::test]
    async fn non_http_exchange_is_skipped() {
        let (tx, mut rx) = mpsc::channel(8);
        let ledger = ConnectionLedger::new(tx, Duration::from_secs(4));
        let conn_id = ConnId {
            tgid: 2,
            fd: 4,
            opened_ns: 1,
        };

        ledger.handle_data(&data_event(
            conn_id,
            TrafficDirection::Ingress,
            b"\x00\x01binary",
            (0, 0),
        ));
        ledger.handle_data(&data_event(
            conn_id,
            TrafficDirection::Egress,
            b"\x00\x02binary",
            (8, 0),
        ));
        ledger.handle_data(&data_event(
            conn_id,
            TrafficDirection::Ingress,
            b"",
            (0, 8),
        ));

        ledger.harvest().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_drained_trackers_are_evicted() {
        let (tx, _rx) = mpsc::channel(8);
        let ledger = ConnectionLedger::new(tx, Duration::from_secs(4));
        let conn_id = ConnId {
            tgid: 3,
            fd: 5,
            opened_ns: 2,
        };

        ledger.handle_open(&SocketOpenEvent {
            timestamp_ns: 2,
            conn_id,
            addr: SockAddrIn::default(),
        });
        assert_eq!(ledger.live_connections(), 1);

        ledger.handle_close(&SocketCloseEvent {
            timestamp_ns: 3,
            conn_id,
        });
        ledger.harvest().await;
        assert_eq!(ledger.live_connections(), 0);
    }
}
