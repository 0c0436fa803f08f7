use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{DestinationResolver, HookCfg, Hooks};
use crate::error::Result;

/// In-memory stand-in for the kernel hooks, used by tests and by runs on
/// machines without eBPF support enabled.
///
/// Records every call so tests can assert the orchestrator drove the
/// boundary in the right order, and serves destination lookups from a plain
/// map.
#[derive(Default)]
pub struct MockHooks {
    loaded: AtomicBool,
    calls: Mutex<Vec<String>>,
    pass_through_ports: Mutex<Vec<u16>>,
    destinations: DashMap<u16, SocketAddr>,
}

impl MockHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pass_through_ports(&self) -> Vec<u16> {
        self.pass_through_ports.lock().unwrap().clone()
    }

    /// Register the original destination for a redirected source port.
    pub fn set_destination(&self, src_port: u16, dest: SocketAddr) {
        self.destinations.insert(src_port, dest);
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Hooks for MockHooks {
    async fn load(&self, cfg: &HookCfg) -> Result<()> {
        self.record(format!("load app_id={}", cfg.app_id));
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_inode(&self, inode: u64) -> Result<()> {
        self.record(format!("send_inode {inode}"));
        Ok(())
    }

    async fn send_proxy_info(&self, ip4: Ipv4Addr, port: u16, _ip6: Ipv6Addr) -> Result<()> {
        self.record(format!("send_proxy_info {ip4}:{port}"));
        Ok(())
    }

    async fn send_pass_through_ports(&self, ports: &[u16]) -> Result<()> {
        self.record(format!("send_pass_through_ports {ports:?}"));
        *self.pass_through_ports.lock().unwrap() = ports.to_vec();
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        self.record("unload");
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl DestinationResolver for MockHooks {
    fn resolve(&self, src_addr: SocketAddr) -> Option<SocketAddr> {
        self.destinations.get(&src_addr.port()).map(|e| *e.value())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::models::Mode;

    #[tokio::test]
    async fn records_boundary_calls_in_order() {
        let hooks = MockHooks::new();
        let cfg = HookCfg {
            app_id: 1,
            pid: 0,
            is_docker: false,
            mode: Mode::Record,
            object_path: PathBuf::from("keploy_ebpf.o"),
            keep_alive_idle_limit: Duration::from_secs(4),
        };

        hooks.load(&cfg).await.unwrap();
        hooks
            .send_proxy_info(Ipv4Addr::LOCALHOST, 16789, Ipv6Addr::LOCALHOST)
            .await
            .unwrap();
        hooks.send_pass_through_ports(&[5432]).await.unwrap();
        hooks.unload().await.unwrap();

        let calls = hooks.calls();
        assert_eq!(calls[0], "load app_id=1");
        assert!(calls[1].starts_with("send_proxy_info"));
        assert_eq!(calls.last().unwrap(), "unload");
        assert!(!hooks.is_loaded());
        assert_eq!(hooks.pass_through_ports(), vec![5432]);
    }

    #[test]
    fn resolves_registered_destinations() {
        let hooks = MockHooks::new();
        let dest: SocketAddr = "10.0.0.5:5432".parse().unwrap();
        hooks.set_destination(40000, dest);

        let src: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert_eq!(hooks.resolve(src), Some(dest));
        let other: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        assert!(hooks.resolve(other).is_none());
    }
}
