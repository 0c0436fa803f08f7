use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicI32, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use keploy_common::{ConnId, SockAddrIn, TrafficDirection};
use tracing::{debug, warn};

/// Per-buffer cap. Bytes past this are dropped and the exchange is marked
/// malformed so it is never emitted.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// One fully observed request/response exchange, popped off a tracker.
#[derive(Debug)]
pub struct Exchange {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub req_timestamp: DateTime<Utc>,
    pub res_timestamp: DateTime<Utc>,
}

/// Byte-stream reassembly state for one tracked socket.
///
/// The request side accumulates bytes the application read (`recv_buf`), the
/// response side bytes it wrote back (`sent_buf`). A direction flip closes
/// the side that was being filled: response bytes after request bytes close
/// the request, request bytes after response bytes close the response and
/// complete the exchange. Closed sides rotate into queues so keep-alive
/// connections can carry several exchanges before any is harvested.
pub struct Tracker {
    conn_id: ConnId,
    completed_exchanges: AtomicI32,
    inner: Mutex<Inner>,
}

struct Inner {
    addr: Option<SockAddrIn>,
    open_timestamp_ns: u64,
    close_timestamp_ns: u64,
    last_activity: Instant,

    recv_buf: Vec<u8>,
    sent_buf: Vec<u8>,
    recv_bytes: u64,
    sent_bytes: u64,

    pending_recv: VecDeque<Vec<u8>>,
    pending_sent: VecDeque<Vec<u8>>,
    expected_recv: VecDeque<u64>,
    actual_recv: VecDeque<u64>,
    expected_sent: VecDeque<u64>,
    actual_sent: VecDeque<u64>,
    pending_req_ts: VecDeque<DateTime<Utc>>,
    pending_res_ts: VecDeque<DateTime<Utc>>,
    pending_malformed: VecDeque<bool>,

    req_timestamp: DateTime<Utc>,
    res_timestamp: DateTime<Utc>,

    last_direction: Option<TrafficDirection>,
    first_request: bool,
    got_request_event: bool,
    got_response_event: bool,
    /// Current exchange overflowed a buffer cap.
    malformed: bool,
}

impl Tracker {
    pub fn new(conn_id: ConnId) -> Self {
        Self {
            conn_id,
            completed_exchanges: AtomicI32::new(0),
            inner: Mutex::new(Inner {
                addr: None,
                open_timestamp_ns: 0,
                close_timestamp_ns: 0,
                last_activity: Instant::now(),
                recv_buf: Vec::new(),
                sent_buf: Vec::new(),
                recv_bytes: 0,
                sent_bytes: 0,
                pending_recv: VecDeque::new(),
                pending_sent: VecDeque::new(),
                expected_recv: VecDeque::new(),
                actual_recv: VecDeque::new(),
                expected_sent: VecDeque::new(),
                actual_sent: VecDeque::new(),
                pending_req_ts: VecDeque::new(),
                pending_res_ts: VecDeque::new(),
                pending_malformed: VecDeque::new(),
                req_timestamp: Utc::now(),
                res_timestamp: Utc::now(),
                last_direction: None,
                first_request: true,
                got_request_event: false,
                got_response_event: false,
                malformed: false,
            }),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn add_open_event(&self, timestamp_ns: u64, addr: SockAddrIn) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = Instant::now();
        if inner.open_timestamp_ns != 0 && inner.open_timestamp_ns != timestamp_ns {
            debug!(
                event.name = "tracker.open_timestamp_changed",
                conn.id = %self.conn_id,
                from = inner.open_timestamp_ns,
                to = timestamp_ns,
                "open timestamp changed by a new event"
            );
        }
        inner.open_timestamp_ns = timestamp_ns;
        inner.addr = Some(addr);
    }

    pub fn add_close_event(&self, timestamp_ns: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = Instant::now();
        inner.close_timestamp_ns = timestamp_ns;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().close_timestamp_ns != 0
    }

    pub fn peer_addr(&self) -> Option<SockAddrIn> {
        self.inner.lock().unwrap().addr
    }

    /// Append payload bytes for one direction.
    ///
    /// `msg_size` is the size of the original syscall payload (which may
    /// exceed `payload.len()` when the kernel clamped the capture);
    /// `validated` is the kernel's running byte count for that side, used to
    /// verify nothing was lost before an exchange is emitted.
    pub fn add_data_event(
        &self,
        direction: TrafficDirection,
        payload: &[u8],
        msg_size: u64,
        validated: u64,
    ) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.last_activity = Instant::now();

        // a direction flip closes the side that was being filled
        match (direction, inner.last_direction) {
            (TrafficDirection::Egress, Some(TrafficDirection::Ingress)) => {
                self.rotate_request(inner, validated);
            }
            (TrafficDirection::Ingress, Some(TrafficDirection::Egress)) => {
                self.rotate_response(inner, validated);
            }
            _ => {}
        }

        match direction {
            TrafficDirection::Ingress => {
                if inner.first_request && inner.recv_buf.is_empty() {
                    debug!(
                        event.name = "tracker.first_request",
                        conn.id = %self.conn_id,
                        "first request bytes on connection"
                    );
                }
                if inner.recv_buf.is_empty() {
                    inner.req_timestamp = Utc::now();
                }
                Self::append_capped(
                    &mut inner.recv_buf,
                    payload,
                    &mut inner.malformed,
                    self.conn_id,
                );
                inner.recv_bytes += msg_size;
                inner.got_request_event = true;
            }
            TrafficDirection::Egress => {
                if inner.sent_buf.is_empty() {
                    inner.res_timestamp = Utc::now();
                }
                Self::append_capped(
                    &mut inner.sent_buf,
                    payload,
                    &mut inner.malformed,
                    self.conn_id,
                );
                inner.sent_bytes += msg_size;
                inner.got_response_event = true;
            }
        }
        inner.last_direction = Some(direction);
    }

    fn append_capped(buf: &mut Vec<u8>, payload: &[u8], malformed: &mut bool, conn_id: ConnId) {
        let room = MAX_BUFFER_SIZE.saturating_sub(buf.len());
        if payload.len() > room {
            if !*malformed {
                warn!(
                    event.name = "tracker.buffer_cap_exceeded",
                    conn.id = %conn_id,
                    cap_bytes = MAX_BUFFER_SIZE,
                    "buffer cap exceeded, dropping excess and marking exchange malformed"
                );
            }
            *malformed = true;
        }
        buf.extend_from_slice(&payload[..payload.len().min(room)]);
    }

    /// Response bytes arrived after request bytes: the request is complete.
    fn rotate_request(&self, inner: &mut Inner, validated: u64) {
        let buf = std::mem::take(&mut inner.recv_buf);
        inner.pending_recv.push_back(buf);
        let expected = std::mem::take(&mut inner.recv_bytes);
        inner.expected_recv.push_back(expected);
        inner.actual_recv.push_back(validated);
        let ts = inner.req_timestamp;
        inner.pending_req_ts.push_back(ts);
        inner.first_request = false;
        inner.got_request_event = false;
    }

    /// Request bytes arrived after response bytes: the response is complete
    /// and with it the whole exchange.
    fn rotate_response(&self, inner: &mut Inner, validated: u64) {
        let buf = std::mem::take(&mut inner.sent_buf);
        inner.pending_sent.push_back(buf);
        let expected = std::mem::take(&mut inner.sent_bytes);
        inner.expected_sent.push_back(expected);
        inner.actual_sent.push_back(validated);
        let ts = inner.res_timestamp;
        inner.pending_res_ts.push_back(ts);
        let malformed = std::mem::take(&mut inner.malformed);
        inner.pending_malformed.push_back(malformed);
        inner.got_response_event = false;
        self.completed_exchanges.fetch_add(1, Ordering::SeqCst);
    }

    pub fn completed_exchanges(&self) -> i32 {
        self.completed_exchanges.load(Ordering::SeqCst)
    }

    pub fn is_inactive(&self, limit: Duration) -> bool {
        self.inner.lock().unwrap().last_activity.elapsed() > limit
    }

    /// Read-only view of the in-flight request/response buffers.
    pub fn snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        (inner.recv_buf.clone(), inner.sent_buf.clone())
    }

    /// Pop one completed exchange, if any is ready.
    ///
    /// A queued exchange is returned when its userspace byte counts match the
    /// kernel-validated counts on both sides. When nothing is queued but a
    /// response was observed and the connection has idled past `idle_limit`,
    /// the in-flight buffers form the final exchange of a keep-alive chain;
    /// that tail is emitted only when both directions were actually observed,
    /// and the tracker resets either way.
    pub fn is_complete(&self, idle_limit: Duration) -> Option<Exchange> {
        let mut inner = self.inner.lock().unwrap();

        if self.completed_exchanges.load(Ordering::SeqCst) > 0 {
            self.completed_exchanges.fetch_sub(1, Ordering::SeqCst);

            let expected_recv = inner.expected_recv.pop_front();
            let actual_recv = inner.actual_recv.pop_front();
            let expected_sent = inner.expected_sent.pop_front();
            let actual_sent = inner.actual_sent.pop_front();
            let request = inner.pending_recv.pop_front();
            let response = inner.pending_sent.pop_front();
            let req_timestamp = inner.pending_req_ts.pop_front();
            let res_timestamp = inner.pending_res_ts.pop_front();
            let malformed = inner.pending_malformed.pop_front().unwrap_or(false);

            let (Some(expected_recv), Some(actual_recv), Some(expected_sent), Some(actual_sent)) =
                (expected_recv, actual_recv, expected_sent, actual_sent)
            else {
                warn!(
                    event.name = "tracker.queue_mismatch",
                    conn.id = %self.conn_id,
                    "exchange queues out of step, dropping exchange"
                );
                return None;
            };
            let (Some(request), Some(response), Some(req_timestamp), Some(res_timestamp)) =
                (request, response, req_timestamp, res_timestamp)
            else {
                warn!(
                    event.name = "tracker.missing_buffers",
                    conn.id = %self.conn_id,
                    "no data buffer for a verified exchange, dropping"
                );
                return None;
            };

            if malformed {
                warn!(
                    event.name = "tracker.malformed_exchange_dropped",
                    conn.id = %self.conn_id,
                    "dropping exchange that overflowed the buffer cap"
                );
                return None;
            }
            if expected_recv != actual_recv {
                debug!(
                    event.name = "tracker.malformed_request",
                    conn.id = %self.conn_id,
                    expected = expected_recv,
                    actual = actual_recv,
                    "request byte counts disagree"
                );
                return None;
            }
            if expected_sent != actual_sent {
                debug!(
                    event.name = "tracker.malformed_response",
                    conn.id = %self.conn_id,
                    expected = expected_sent,
                    actual = actual_sent,
                    "response byte counts disagree"
                );
                return None;
            }

            return Some(Exchange {
                request,
                response,
                req_timestamp,
                res_timestamp,
            });
        }

        if inner.got_response_event && inner.last_activity.elapsed() >= idle_limit {
            debug!(
                event.name = "tracker.keepalive_tail",
                conn.id = %self.conn_id,
                "idle limit hit, flushing final exchange of keep-alive chain"
            );

            // request side was rotated when the response started
            let request = inner.pending_recv.pop_front();
            let expected_recv = inner.expected_recv.pop_front();
            let actual_recv = inner.actual_recv.pop_front();
            let req_timestamp = inner.pending_req_ts.pop_front();

            let result = match (request, expected_recv, actual_recv, req_timestamp) {
                (Some(request), Some(expected), Some(actual), Some(req_timestamp))
                    if expected == actual && !inner.malformed && !inner.sent_buf.is_empty() =>
                {
                    Some(Exchange {
                        request,
                        response: std::mem::take(&mut inner.sent_buf),
                        req_timestamp,
                        res_timestamp: inner.res_timestamp,
                    })
                }
                _ => {
                    warn!(
                        event.name = "tracker.tail_dropped",
                        conn.id = %self.conn_id,
                        "keep-alive tail incomplete on one side, dropping"
                    );
                    None
                }
            };

            Self::reset(&mut inner);
            return result;
        }

        None
    }

    fn reset(inner: &mut Inner) {
        inner.first_request = true;
        inner.got_request_event = false;
        inner.got_response_event = false;
        inner.last_direction = None;
        inner.recv_bytes = 0;
        inner.sent_bytes = 0;
        inner.recv_buf = Vec::new();
        inner.sent_buf = Vec::new();
        inner.malformed = false;
    }
}
