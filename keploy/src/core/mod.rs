//! Instrumentation facade: owns the hook boundary, the proxy, the DNS
//! responder, and the registered user applications, and hands the
//! orchestrators their typed capture streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::{App, AppError};
use crate::error::{KeployError, Result};
use crate::hooks::connection::ConnectionLedger;
use crate::hooks::{DestinationResolver, EbpfHooks, HookCfg, Hooks};
use crate::mock::MockStore;
use crate::models::{Mock, Mode, TestCase};
use crate::parser::default_registry;
use crate::proxy::demux::{ParserCtx, ParserRegistry};
use crate::proxy::dns::DnsServer;
use crate::proxy::ProxyServer;
use crate::runtime::component::{ComponentManager, Handle};
use crate::runtime::conf::{Config, NoiseParams};

/// Capacity of the capture streams between the interceptor and persistence.
const STREAM_CAPACITY: usize = 1000;

pub struct Core {
    config: Config,
    hooks: Arc<dyn Hooks>,
    resolver: Arc<dyn DestinationResolver>,
    ledger: Arc<ConnectionLedger>,
    mock_store: Arc<MockStore>,
    registry: Arc<ParserRegistry>,
    apps: DashMap<u64, Arc<App>>,
    next_app_id: AtomicU64,
    incoming_rx: Mutex<Option<mpsc::Receiver<TestCase>>>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<Mock>>>,
    outgoing_tx: mpsc::Sender<Mock>,
    proxy_started: Mutex<bool>,
}

impl Core {
    /// Wire up the production stack: eBPF hooks feeding the connection
    /// ledger, with the loader also serving destination lookups.
    pub fn new(config: Config) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(STREAM_CAPACITY);
        let ledger = Arc::new(ConnectionLedger::new(
            incoming_tx,
            config.keep_alive_idle_limit(),
        ));
        let hooks = Arc::new(EbpfHooks::new(ledger.clone()));
        Self::with_hooks(config, hooks.clone(), hooks, ledger, incoming_rx)
    }

    /// Wire up with an explicit hook boundary; tests pass `MockHooks`.
    pub fn with_hooks(
        config: Config,
        hooks: Arc<dyn Hooks>,
        resolver: Arc<dyn DestinationResolver>,
        ledger: Arc<ConnectionLedger>,
        incoming_rx: mpsc::Receiver<TestCase>,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(STREAM_CAPACITY);
        Arc::new(Self {
            config,
            hooks,
            resolver,
            ledger,
            mock_store: Arc::new(MockStore::new()),
            registry: Arc::new(default_registry()),
            apps: DashMap::new(),
            next_app_id: AtomicU64::new(1),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            outgoing_tx,
            proxy_started: Mutex::new(false),
        })
    }

    /// Register a user application; returns its id.
    pub fn setup(&self, command: &str) -> u64 {
        let id = self.next_app_id.fetch_add(1, Ordering::SeqCst);
        self.apps.insert(id, Arc::new(App::new(id, command)));
        debug!(event.name = "core.app_registered", app.id = id, "app registered");
        id
    }

    /// Load the kernel hooks and start the proxy, DNS responder, and
    /// connection-ledger harvester, registering each with `manager` so
    /// shutdown tears them down after the application but before the
    /// persistence consumers.
    pub async fn hook(
        &self,
        app_id: u64,
        mode: Mode,
        manager: &mut ComponentManager,
    ) -> Result<()> {
        let cfg = HookCfg {
            app_id,
            pid: 0,
            is_docker: !self.config.container_name.is_empty(),
            mode,
            object_path: self.config.ebpf_object_path.clone(),
            keep_alive_idle_limit: self.config.keep_alive_idle_limit(),
        };
        self.hooks.load(&cfg).await?;

        let already_started = {
            let mut started = self.proxy_started.lock().unwrap();
            std::mem::replace(&mut *started, true)
        };
        if already_started {
            debug!(event.name = "core.proxy_already_started", "proxy already started");
            // still refresh the pass-through lists
            self.hooks
                .send_pass_through_ports(&self.config.bypass_ports())
                .await?;
            return Ok(());
        }

        let bypass_hosts = Arc::new(self.config.bypass_hosts());
        let base_ctx = ParserCtx {
            mocks_tx: match mode {
                Mode::Record => Some(self.outgoing_tx.clone()),
                Mode::Test => None,
            },
            mock_store: self.mock_store.clone(),
            bypass_hosts: bypass_hosts.clone(),
            dest_addr: None,
            mock_counter: Arc::new(AtomicU64::new(0)),
        };

        let ledger = self.ledger.clone();
        manager.register(Handle::new(
            "connection-ledger",
            tokio::spawn(ledger.run(manager.subscribe())),
        ));

        let dns = DnsServer::bind(
            self.config.dns_port as u16,
            std::net::Ipv4Addr::LOCALHOST,
            std::net::Ipv6Addr::LOCALHOST,
            bypass_hosts,
        )
        .await?;
        manager.register(Handle::new("dns-responder", tokio::spawn(dns.run(manager.subscribe()))));

        let proxy = ProxyServer::bind(
            self.config.proxy_port as u16,
            mode,
            self.registry.clone(),
            self.resolver.clone(),
            base_ctx,
        )
        .await?;
        let (ip4, port, ip6) = (proxy.ip4(), proxy.port(), proxy.ip6());
        manager.register(Handle::new("proxy", tokio::spawn(proxy.run(manager.subscribe()))));

        self.hooks.send_proxy_info(ip4, port, ip6).await?;
        self.hooks
            .send_pass_through_ports(&self.config.bypass_ports())
            .await?;
        Ok(())
    }

    /// Incoming test-case stream; may be taken once per session.
    pub fn get_incoming(&self) -> Result<mpsc::Receiver<TestCase>> {
        self.incoming_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| KeployError::internal("incoming stream already taken"))
    }

    /// Outgoing mock stream; may be taken once per session.
    pub fn get_outgoing(&self) -> Result<mpsc::Receiver<Mock>> {
        self.outgoing_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| KeployError::internal("outgoing stream already taken"))
    }

    /// Run the registered application to completion or cancellation.
    pub async fn run(
        &self,
        app_id: u64,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> AppError {
        let Some(app) = self.apps.get(&app_id).map(|a| a.clone()) else {
            return AppError::Internal(format!("app with id {app_id} not found"));
        };
        app.run(shutdown_rx).await
    }

    pub fn set_mocks(
        &self,
        test_set: &str,
        filtered: Vec<Mock>,
        unfiltered: Vec<Mock>,
        noise: NoiseParams,
    ) {
        self.mock_store.set_mocks(test_set, filtered, unfiltered, noise);
    }

    pub fn consumed_mocks(&self, test_set: &str) -> Vec<String> {
        self.mock_store.consumed_mocks(test_set)
    }

    pub fn unused_mocks(&self, test_set: &str) -> Vec<String> {
        self.mock_store.unused_mocks(test_set)
    }

    pub async fn unload(&self) -> Result<()> {
        self.hooks.unload().await
    }

    pub fn keep_alive_idle_limit(&self) -> Duration {
        self.config.keep_alive_idle_limit()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::hooks::MockHooks;
    use crate::runtime::shutdown::ShutdownConfig;

    fn test_core(hooks: Arc<MockHooks>, config: Config) -> Arc<Core> {
        let (incoming_tx, incoming_rx) = mpsc::channel(STREAM_CAPACITY);
        let ledger = Arc::new(ConnectionLedger::new(
            incoming_tx,
            config.keep_alive_idle_limit(),
        ));
        Core::with_hooks(config, hooks.clone(), hooks, ledger, incoming_rx)
    }

    #[tokio::test]
    async fn hook_publishes_proxy_info_and_ports() {
        let hooks = Arc::new(MockHooks::new());
        let mut config = Config::default();
        config.proxy_port = 0; // ephemeral
        config.dns_port = 0;
        config.bypass_rules.push(crate::runtime::conf::BypassRule {
            port: 5432,
            ..Default::default()
        });
        let core = test_core(hooks.clone(), config);

        let app_id = core.setup("true");
        let mut manager = ComponentManager::new();
        core.hook(app_id, Mode::Record, &mut manager).await.unwrap();

        assert!(hooks.is_loaded());
        assert_eq!(hooks.pass_through_ports(), vec![5432]);
        let calls = hooks.calls();
        assert!(calls.iter().any(|c| c.starts_with("load")));
        assert!(calls.iter().any(|c| c.starts_with("send_proxy_info")));
        assert_eq!(manager.len(), 3);

        manager.shutdown(ShutdownConfig::default()).await;
        core.unload().await.unwrap();
        assert!(!hooks.is_loaded());
    }

    #[tokio::test]
    async fn record_session_captures_outgoing_mocks_end_to_end() {
        // scripted dependency the "app" calls through the proxy
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr: SocketAddr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            let mut sink = vec![0u8; 1024];
            let _ = sock.read(&mut sink).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            let _ = sock.read(&mut sink).await;
        });

        let hooks = Arc::new(MockHooks::new());
        let mut config = Config::default();
        config.proxy_port = 0;
        config.dns_port = 0;
        let core = test_core(hooks.clone(), config);
        let mut outgoing = core.get_outgoing().unwrap();

        let app_id = core.setup("");
        let mut manager = ComponentManager::new();
        core.hook(app_id, Mode::Record, &mut manager).await.unwrap();

        // find the proxy's bound port from the hook call log
        let proxy_port: u16 = hooks
            .calls()
            .iter()
            .find_map(|c| c.strip_prefix("send_proxy_info 127.0.0.1:").map(String::from))
            .unwrap()
            .parse()
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        hooks.set_destination(client.local_addr().unwrap().port(), upstream_addr);
        client
            .write_all(b"GET /dep HTTP/1.1\r\nHost: dep.internal\r\n\r\n")
            .await
            .unwrap();
        let mut answer = vec![0u8; 40];
        client.read_exact(&mut answer).await.unwrap();
        assert!(answer.starts_with(b"HTTP/1.1 200 OK"));
        drop(client);

        let mock = outgoing.recv().await.expect("captured mock");
        assert_eq!(mock.spec.req.url, "/dep");

        manager.shutdown(ShutdownConfig::default()).await;
    }
}
