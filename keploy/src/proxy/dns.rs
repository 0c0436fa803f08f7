//! Minimal UDP DNS responder that steers the application's lookups at the
//! proxy.
//!
//! Queries for ordinary hostnames are answered with the proxy's loopback
//! address so the subsequent TCP connect lands on the interceptor; queries
//! for bypassed hosts are resolved through the system resolver and answered
//! with the real addresses. Only A and AAAA questions are answered; anything
//! else gets NOTIMP.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{KeployError, Result};

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;
const RCODE_NOTIMP: u8 = 4;
const TTL_SECS: u32 = 10;

pub struct DnsServer {
    socket: UdpSocket,
    proxy_ip4: Ipv4Addr,
    proxy_ip6: Ipv6Addr,
    bypass_hosts: Arc<Vec<String>>,
}

impl DnsServer {
    pub async fn bind(
        port: u16,
        proxy_ip4: Ipv4Addr,
        proxy_ip6: Ipv6Addr,
        bypass_hosts: Arc<Vec<String>>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| {
                KeployError::internal(format!("dns responder failed to bind port {port}: {e}"))
            })?;
        info!(event.name = "dns.bound", port = port, "dns responder listening");
        Ok(Self {
            socket,
            proxy_ip4,
            proxy_ip6,
            bypass_hosts,
        })
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or_default()
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut packet = [0u8; 512];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut packet) => {
                    let (len, from) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(
                                event.name = "dns.recv_failed",
                                error.message = %e,
                                "failed to receive dns query"
                            );
                            continue;
                        }
                    };
                    if let Some(answer) = self.answer(&packet[..len]).await {
                        if let Err(e) = self.socket.send_to(&answer, from).await {
                            warn!(
                                event.name = "dns.send_failed",
                                error.message = %e,
                                "failed to send dns answer"
                            );
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(event.name = "dns.stopped", "dns responder stopped");
                    return;
                }
            }
        }
    }

    async fn answer(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = Query::parse(packet)?;

        if query.qtype != TYPE_A && query.qtype != TYPE_AAAA {
            return Some(query.respond(&[], RCODE_NOTIMP));
        }

        let bare = query.name.trim_end_matches('.');
        let bypassed = self
            .bypass_hosts
            .iter()
            .any(|h| h == bare || h == &query.name);

        let ips: Vec<IpAddr> = if bypassed {
            match tokio::net::lookup_host((bare, 0u16)).await {
                Ok(addrs) => addrs.map(|a| a.ip()).collect(),
                Err(e) => {
                    debug!(
                        event.name = "dns.upstream_failed",
                        host = %bare,
                        error.message = %e,
                        "system resolver failed for bypassed host"
                    );
                    Vec::new()
                }
            }
        } else if query.qtype == TYPE_A {
            vec![IpAddr::V4(self.proxy_ip4)]
        } else {
            vec![IpAddr::V6(self.proxy_ip6)]
        };

        let matching: Vec<IpAddr> = ips
            .into_iter()
            .filter(|ip| match query.qtype {
                TYPE_A => ip.is_ipv4(),
                _ => ip.is_ipv6(),
            })
            .collect();

        debug!(
            event.name = "dns.answered",
            host = %query.name,
            bypassed = bypassed,
            answers = matching.len(),
            "dns query answered"
        );
        Some(query.respond(&matching, 0))
    }
}

struct Query {
    id: u16,
    name: String,
    qtype: u16,
    /// The raw question section, echoed back in the response.
    question: Vec<u8>,
}

impl Query {
    /// Parse the header and first question of a DNS query packet.
    fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 12 {
            return None;
        }
        let id = u16::from_be_bytes([packet[0], packet[1]]);
        let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
        if qdcount == 0 {
            return None;
        }

        let mut pos = 12;
        let mut labels = Vec::new();
        loop {
            let len = *packet.get(pos)? as usize;
            pos += 1;
            if len == 0 {
                break;
            }
            let label = packet.get(pos..pos + len)?;
            labels.push(String::from_utf8_lossy(label).to_string());
            pos += len;
        }
        let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
        let question = packet.get(12..pos + 4)?.to_vec();

        Some(Self {
            id,
            name: labels.join("."),
            qtype,
            question,
        })
    }

    /// Build a response packet carrying `ips` as answers.
    fn respond(&self, ips: &[IpAddr], rcode: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.id.to_be_bytes());
        // QR=1, AA=1, RD copied off; RA=1
        out.push(0x85);
        out.push(0x80 | rcode);
        out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        out.extend_from_slice(&(ips.len() as u16).to_be_bytes()); // ANCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
        out.extend_from_slice(&self.question);

        for ip in ips {
            // pointer to the name at offset 12
            out.extend_from_slice(&0xc00cu16.to_be_bytes());
            match ip {
                IpAddr::V4(v4) => {
                    out.extend_from_slice(&TYPE_A.to_be_bytes());
                    out.extend_from_slice(&CLASS_IN.to_be_bytes());
                    out.extend_from_slice(&TTL_SECS.to_be_bytes());
                    out.extend_from_slice(&4u16.to_be_bytes());
                    out.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    out.extend_from_slice(&TYPE_AAAA.to_be_bytes());
                    out.extend_from_slice(&CLASS_IN.to_be_bytes());
                    out.extend_from_slice(&TTL_SECS.to_be_bytes());
                    out.extend_from_slice(&16u16.to_be_bytes());
                    out.extend_from_slice(&v6.octets());
                }
            }
        }
        out
    }
}

/// Encode a bare query packet; test helper and reference for the wire shape.
#[cfg(test)]
fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&[0x01, 0x00]); // RD
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0; 6]);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out
}
