//! The in-process transparent proxy: loopback listeners the kernel redirect
//! points at, per-connection protocol classification, and verbatim relay for
//! flows no parser claims.

pub mod demux;
pub mod dns;
pub mod util;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{KeployError, Result};
use crate::hooks::DestinationResolver;
use crate::models::Mode;
use demux::{ParserCtx, ParserRegistry};
use util::{passthrough, read_chunk_unbounded};

/// The proxy's listening sockets plus everything a connection needs.
pub struct ProxyServer {
    v4: TcpListener,
    v6: Option<TcpListener>,
    mode: Mode,
    registry: Arc<ParserRegistry>,
    resolver: Arc<dyn DestinationResolver>,
    base_ctx: ParserCtx,
}

impl ProxyServer {
    /// Bind the IPv4 (and, where the host supports it, IPv6) loopback
    /// listeners. Failure to bind the IPv4 listener is fatal.
    pub async fn bind(
        port: u16,
        mode: Mode,
        registry: Arc<ParserRegistry>,
        resolver: Arc<dyn DestinationResolver>,
        base_ctx: ParserCtx,
    ) -> Result<Self> {
        let v4 = bind_reusable((Ipv4Addr::LOCALHOST, port).into()).map_err(|e| {
            KeployError::internal(format!("proxy failed to bind 127.0.0.1:{port}: {e}"))
        })?;
        let v6 = match bind_reusable((Ipv6Addr::LOCALHOST, port).into()) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(
                    event.name = "proxy.no_ipv6",
                    error.message = %e,
                    "IPv6 loopback unavailable, serving IPv4 only"
                );
                None
            }
        };
        info!(
            event.name = "proxy.bound",
            port = port,
            ipv6 = v6.is_some(),
            "proxy listening on loopback"
        );
        Ok(Self {
            v4,
            v6,
            mode,
            registry,
            resolver,
            base_ctx,
        })
    }

    pub fn ip4(&self) -> Ipv4Addr {
        Ipv4Addr::LOCALHOST
    }

    pub fn ip6(&self) -> Ipv6Addr {
        Ipv6Addr::LOCALHOST
    }

    pub fn port(&self) -> u16 {
        self.v4.local_addr().map(|a| a.port()).unwrap_or_default()
    }

    /// Accept loop; one task per connection, until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.v4.accept() => self.spawn_connection(accepted),
                accepted = accept_optional(self.v6.as_ref()) => self.spawn_connection(accepted),
                _ = shutdown_rx.recv() => {
                    info!(event.name = "proxy.stopped", "proxy accept loop stopped");
                    return;
                }
            }
        }
    }

    fn spawn_connection(&self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    event.name = "proxy.accept_failed",
                    error.message = %e,
                    "failed to accept redirected connection"
                );
                return;
            }
        };

        let mode = self.mode;
        let registry = self.registry.clone();
        let resolver = self.resolver.clone();
        let base_ctx = self.base_ctx.clone();

        let conn = tokio::spawn(async move {
            handle_connection(stream, peer, mode, registry, resolver, base_ctx).await
        });

        // contain per-connection failures and panics; the session keeps going
        tokio::spawn(async move {
            match conn.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(
                        event.name = "proxy.connection_failed",
                        peer = %peer,
                        error.message = %e,
                        "redirected connection ended with an error"
                    );
                }
                Err(join_err) => {
                    let correlation_id: u64 = rand::thread_rng().r#gen();
                    error!(
                        event.name = "proxy.connection_panicked",
                        peer = %peer,
                        correlation.id = format!("{correlation_id:016x}"),
                        error.message = %join_err,
                        "connection task panicked; session continues"
                    );
                }
            }
        });
    }
}

/// Bind with SO_REUSEADDR so back-to-back sessions can reuse the proxy port
/// while old sockets sit in TIME_WAIT.
fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

async fn accept_optional(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    mode: Mode,
    registry: Arc<ParserRegistry>,
    resolver: Arc<dyn DestinationResolver>,
    mut ctx: ParserCtx,
) -> Result<()> {
    let dest_addr = resolver.resolve(peer);
    ctx.dest_addr = dest_addr;

    let prefix = read_chunk_unbounded(&mut stream).await?;
    if prefix.is_empty() {
        return Ok(());
    }

    match registry.classify(&prefix) {
        Some(parser) => {
            debug!(
                event.name = "proxy.flow_classified",
                peer = %peer,
                kind = %parser.kind(),
                dest = ?dest_addr,
                "flow claimed by parser"
            );
            let dest = match mode {
                Mode::Record => Some(connect_upstream(dest_addr, peer).await?),
                Mode::Test => None,
            };
            parser.process_outgoing(&prefix, stream, dest, mode, ctx).await
        }
        None => {
            debug!(
                event.name = "proxy.flow_passthrough",
                peer = %peer,
                dest = ?dest_addr,
                "no parser claimed the flow, relaying verbatim"
            );
            let mut upstream = connect_upstream(dest_addr, peer).await?;
            passthrough(&mut stream, &mut upstream, &[prefix]).await?;
            Ok(())
        }
    }
}

async fn connect_upstream(dest_addr: Option<SocketAddr>, peer: SocketAddr) -> Result<TcpStream> {
    let addr = dest_addr.ok_or_else(|| {
        KeployError::internal(format!(
            "no original destination recorded for connection from {peer}"
        ))
    })?;
    TcpStream::connect(addr).await.map_err(|e| {
        // a single upstream failure is reported per connection, not fatal
        KeployError::internal(format!("failed to reach upstream {addr}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::hooks::MockHooks;
    use crate::mock::MockStore;
    use crate::parser::default_registry;

    fn base_ctx(mocks_tx: Option<mpsc::Sender<crate::models::Mock>>) -> ParserCtx {
        ParserCtx {
            mocks_tx,
            mock_store: Arc::new(MockStore::new()),
            bypass_hosts: Arc::new(Vec::new()),
            dest_addr: None,
            mock_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// End-to-end through real sockets: a scripted upstream, the proxy in
    /// record mode, and a client whose connection is redirected by the mock
    /// resolver.
    #[tokio::test]
    async fn record_mode_proxies_and_captures_over_real_sockets() {
        // scripted upstream http server
        let upstream = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            let mut sink = vec![0u8; 1024];
            let n = sock.read(&mut sink).await.unwrap();
            assert!(n > 0);
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]")
                .await
                .unwrap();
            let _ = sock.read(&mut sink).await;
        });

        let hooks = Arc::new(MockHooks::new());
        let (mocks_tx, mut mocks_rx) = mpsc::channel(4);
        let proxy = ProxyServer::bind(
            0,
            Mode::Record,
            Arc::new(default_registry()),
            hooks.clone(),
            base_ctx(Some(mocks_tx)),
        )
        .await
        .unwrap();
        let proxy_port = proxy.port();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let proxy_task = tokio::spawn(proxy.run(shutdown_rx));

        // "redirected" client: connect to the proxy, register the original
        // destination under our source port
        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
            .await
            .unwrap();
        hooks.set_destination(client.local_addr().unwrap().port(), upstream_addr);

        let mut client = client;
        client
            .write_all(b"GET /rows HTTP/1.1\r\nHost: db.internal\r\n\r\n")
            .await
            .unwrap();
        let mut answer = vec![0u8; 40];
        client.read_exact(&mut answer).await.unwrap();
        assert!(answer.starts_with(b"HTTP/1.1 200 OK"));
        drop(client);

        let mock = mocks_rx.recv().await.expect("captured mock");
        assert_eq!(mock.spec.req.url, "/rows");
        assert_eq!(mock.spec.resp.body, b"[]");

        let _ = shutdown_tx.send(());
        proxy_task.await.unwrap();
    }

    /// A flow whose first bytes no parser claims is relayed verbatim.
    #[tokio::test]
    async fn unclaimed_flow_passes_through() {
        let upstream = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            let mut buf = vec![0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING");
            sock.write_all(b"PONG").await.unwrap();
        });

        let hooks = Arc::new(MockHooks::new());
        let proxy = ProxyServer::bind(
            0,
            Mode::Record,
            Arc::new(default_registry()),
            hooks.clone(),
            base_ctx(None),
        )
        .await
        .unwrap();
        let proxy_port = proxy.port();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let proxy_task = tokio::spawn(proxy.run(shutdown_rx));

        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
            .await
            .unwrap();
        hooks.set_destination(client.local_addr().unwrap().port(), upstream_addr);

        let mut client = client;
        client.write_all(b"PING").await.unwrap();
        let mut answer = vec![0u8; 4];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"PONG");

        let _ = shutdown_tx.send(());
        proxy_task.await.unwrap();
    }
}
