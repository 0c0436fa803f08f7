//! Kernel hook boundary: socket redirection, original-destination recovery,
//! and the socket-event intake that feeds the connection ledger.
//!
//! The eBPF program itself is an opaque object file; everything the core
//! needs from it goes through the [`Hooks`] trait (loading, publishing the
//! proxy endpoint, pass-through ports, the traced inode) and the
//! [`DestinationResolver`] side channel (original destination of a
//! redirected connect). [`MockHooks`] stands in for both in tests.

pub mod connection;
mod ebpf;
mod mock;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Mode;

pub use ebpf::EbpfHooks;
pub use mock::MockHooks;

/// Parameters for loading the kernel hooks for one application.
#[derive(Clone, Debug)]
pub struct HookCfg {
    pub app_id: u64,
    /// Pid (or container pid-namespace leader) to scope interception to.
    pub pid: u32,
    pub is_docker: bool,
    pub mode: Mode,
    /// Path of the opaque eBPF object file.
    pub object_path: PathBuf,
    /// Idle window after which a keep-alive chain's final exchange flushes.
    pub keep_alive_idle_limit: Duration,
}

/// Loader boundary for the kernel component.
///
/// `load` is idempotent: a second call is a no-op that still refreshes the
/// pass-through lists. Failure to load is fatal for the session.
#[async_trait]
pub trait Hooks: Send + Sync {
    async fn load(&self, cfg: &HookCfg) -> Result<()>;

    /// Publish the inode of the traced (containerized) process.
    async fn send_inode(&self, inode: u64) -> Result<()>;

    /// Publish the proxy's listening endpoints so redirected connects land
    /// on them.
    async fn send_proxy_info(&self, ip4: Ipv4Addr, port: u16, ip6: Ipv6Addr) -> Result<()>;

    /// Publish destination ports whose traffic must not be redirected.
    async fn send_pass_through_ports(&self, ports: &[u16]) -> Result<()>;

    async fn unload(&self) -> Result<()>;
}

/// Recovers the original `(dst_ip, dst_port)` of a redirected connection,
/// keyed by the source port the kernel observed at redirect time.
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, src_addr: SocketAddr) -> Option<SocketAddr>;
}
