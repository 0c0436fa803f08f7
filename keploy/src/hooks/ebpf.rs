use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use aya::maps::{Array, HashMap as BpfHashMap, MapData, RingBuf};
use aya::programs::Program;
use keploy_common::{
    DestInfo, ProxyInfo, SocketCloseEvent, SocketDataEvent, SocketOpenEvent,
};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DestinationResolver, HookCfg, Hooks, connection::ConnectionLedger};
use crate::error::{KeployError, Result};

// Map and ring-buffer names the opaque object file is expected to export.
const MAP_OPEN_EVENTS: &str = "SOCKET_OPEN_EVENTS";
const MAP_DATA_EVENTS: &str = "SOCKET_DATA_EVENTS";
const MAP_CLOSE_EVENTS: &str = "SOCKET_CLOSE_EVENTS";
const MAP_PROXY_INFO: &str = "PROXY_INFO";
const MAP_PASS_THROUGH_PORTS: &str = "PASS_THROUGH_PORTS";
const MAP_DEST_INFO: &str = "DEST_INFO";
const MAP_APP_INODE: &str = "APP_INODE";

/// Slots in the pass-through port array; unused slots hold zero.
const PASS_THROUGH_SLOTS: u32 = 16;

struct Loaded {
    // keeps programs attached for the lifetime of the session
    _ebpf: aya::Ebpf,
    proxy_info: Array<MapData, ProxyInfo>,
    pass_through: Array<MapData, u16>,
    app_inode: Array<MapData, u64>,
    pumps: Vec<JoinHandle<()>>,
}

/// Kernel hook loader backed by aya.
///
/// The eBPF object file is treated as opaque: every program it exports is
/// loaded and attached by its own name (kprobes attach to the symbol they
/// are named after, tracepoints to the `category__name` they are named
/// after), and the maps above form the userspace contract.
pub struct EbpfHooks {
    ledger: Arc<ConnectionLedger>,
    state: tokio::sync::Mutex<Option<Loaded>>,
    dest_info: std::sync::Mutex<Option<BpfHashMap<MapData, u32, DestInfo>>>,
}

impl EbpfHooks {
    pub fn new(ledger: Arc<ConnectionLedger>) -> Self {
        Self {
            ledger,
            state: tokio::sync::Mutex::new(None),
            dest_info: std::sync::Mutex::new(None),
        }
    }

    /// Bump the memlock rlimit. Needed for older kernels that don't use the
    /// memcg based accounting, see https://lwn.net/Articles/837122/
    fn bump_memlock_rlimit() {
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            warn!("remove limit on locked memory failed, ret is: {ret}");
        }
    }

    fn attach_all(ebpf: &mut aya::Ebpf) -> Result<()> {
        let names: Vec<String> = ebpf.programs().map(|(name, _)| name.to_string()).collect();
        for name in names {
            let program = ebpf
                .program_mut(&name)
                .ok_or_else(|| KeployError::internal(format!("program '{name}' vanished")))?;
            match program {
                Program::KProbe(p) => {
                    p.load().map_err(load_err(&name))?;
                    p.attach(&name, 0).map_err(attach_err(&name))?;
                    debug!(event.name = "hooks.attached", program = %name, "kprobe attached");
                }
                Program::TracePoint(p) => {
                    let (category, point) = name.split_once("__").ok_or_else(|| {
                        KeployError::internal(format!(
                            "tracepoint '{name}' is not named category__name"
                        ))
                    })?;
                    p.load().map_err(load_err(&name))?;
                    p.attach(category, point).map_err(attach_err(&name))?;
                    debug!(event.name = "hooks.attached", program = %name, "tracepoint attached");
                }
                _ => {
                    debug!(
                        event.name = "hooks.program_skipped",
                        program = %name,
                        "program type attaches on demand, skipping"
                    );
                }
            }
        }
        Ok(())
    }

    fn take_array<V: aya::Pod>(ebpf: &mut aya::Ebpf, name: &str) -> Result<Array<MapData, V>> {
        let map = ebpf
            .take_map(name)
            .ok_or_else(|| KeployError::internal(format!("{name} map not present in the object")))?;
        Array::try_from(map)
            .map_err(|e| KeployError::internal(format!("{name} map has unexpected shape: {e}")))
    }

    fn spawn_pump<E, F>(ebpf: &mut aya::Ebpf, name: &str, handler: F) -> Result<JoinHandle<()>>
    where
        E: Copy + 'static,
        F: Fn(E) + Send + 'static,
    {
        let map = ebpf
            .take_map(name)
            .ok_or_else(|| KeployError::internal(format!("{name} map not present in the object")))?;
        let mut ring = RingBuf::try_from(map)
            .map_err(|e| KeployError::internal(format!("{name} is not a ring buffer: {e}")))?;
        let map_name = name.to_string();

        Ok(tokio::spawn(async move {
            use std::os::fd::AsRawFd;
            let async_fd = match AsyncFd::new(ring.as_raw_fd()) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(
                        event.name = "hooks.pump_failed",
                        map = %map_name,
                        error.message = %e,
                        "failed to poll ring buffer"
                    );
                    return;
                }
            };

            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
                while let Some(item) = ring.next() {
                    if item.len() < std::mem::size_of::<E>() {
                        warn!(
                            event.name = "hooks.truncated_event",
                            map = %map_name,
                            "ring buffer item shorter than its event type"
                        );
                        continue;
                    }
                    let event: E =
                        unsafe { std::ptr::read_unaligned(item.as_ptr() as *const E) };
                    handler(event);
                }
                guard.clear_ready();
            }
        }))
    }
}

fn load_err(name: &str) -> impl FnOnce(aya::programs::ProgramError) -> KeployError + '_ {
    move |e| KeployError::internal(format!("failed to load program '{name}': {e}"))
}

fn attach_err(name: &str) -> impl FnOnce(aya::programs::ProgramError) -> KeployError + '_ {
    move |e| KeployError::internal(format!("failed to attach program '{name}': {e}"))
}

#[async_trait]
impl Hooks for EbpfHooks {
    async fn load(&self, cfg: &HookCfg) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!(
                event.name = "hooks.already_loaded",
                "hooks already loaded, refreshing lists only"
            );
            return Ok(());
        }

        Self::bump_memlock_rlimit();

        let mut ebpf = aya::Ebpf::load_file(&cfg.object_path).map_err(|e| {
            KeployError::internal(format!(
                "failed to load eBPF object {}: {e}; the agent needs CAP_BPF/CAP_SYS_ADMIN \
                 and a BTF-enabled kernel (>= 5.8)",
                cfg.object_path.display()
            ))
        })?;

        Self::attach_all(&mut ebpf)?;

        let proxy_info = Self::take_array::<ProxyInfo>(&mut ebpf, MAP_PROXY_INFO)?;
        let pass_through = Self::take_array::<u16>(&mut ebpf, MAP_PASS_THROUGH_PORTS)?;
        let app_inode = Self::take_array::<u64>(&mut ebpf, MAP_APP_INODE)?;

        let dest_map = ebpf.take_map(MAP_DEST_INFO).ok_or_else(|| {
            KeployError::internal(format!("{MAP_DEST_INFO} map not present in the object"))
        })?;
        let dest_info = BpfHashMap::try_from(dest_map).map_err(|e| {
            KeployError::internal(format!("{MAP_DEST_INFO} map has unexpected shape: {e}"))
        })?;
        *self.dest_info.lock().unwrap() = Some(dest_info);

        let ledger = self.ledger.clone();
        let open_pump =
            Self::spawn_pump::<SocketOpenEvent, _>(&mut ebpf, MAP_OPEN_EVENTS, move |ev| {
                ledger.handle_open(&ev);
            })?;
        let ledger = self.ledger.clone();
        let data_pump =
            Self::spawn_pump::<SocketDataEvent, _>(&mut ebpf, MAP_DATA_EVENTS, move |ev| {
                ledger.handle_data(&ev);
            })?;
        let ledger = self.ledger.clone();
        let close_pump =
            Self::spawn_pump::<SocketCloseEvent, _>(&mut ebpf, MAP_CLOSE_EVENTS, move |ev| {
                ledger.handle_close(&ev);
            })?;

        *state = Some(Loaded {
            _ebpf: ebpf,
            proxy_info,
            pass_through,
            app_inode,
            pumps: vec![open_pump, data_pump, close_pump],
        });

        info!(
            event.name = "hooks.loaded",
            app.id = cfg.app_id,
            pid = cfg.pid,
            "kernel hooks loaded and attached"
        );
        Ok(())
    }

    async fn send_inode(&self, inode: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let loaded = state
            .as_mut()
            .ok_or_else(|| KeployError::internal("hooks not loaded"))?;
        loaded
            .app_inode
            .set(0, inode, 0)
            .map_err(|e| KeployError::internal(format!("failed to publish app inode: {e}")))
    }

    async fn send_proxy_info(&self, ip4: Ipv4Addr, port: u16, ip6: Ipv6Addr) -> Result<()> {
        let mut state = self.state.lock().await;
        let loaded = state
            .as_mut()
            .ok_or_else(|| KeployError::internal("hooks not loaded"))?;

        let octets = ip6.octets();
        let mut ip6_words = [0u32; 4];
        for (i, chunk) in octets.chunks_exact(4).enumerate() {
            ip6_words[i] = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let info = ProxyInfo {
            ip4: u32::from(ip4).to_be(),
            ip6: ip6_words,
            port: u32::from(port),
        };
        loaded
            .proxy_info
            .set(0, info, 0)
            .map_err(|e| KeployError::internal(format!("failed to publish proxy info: {e}")))
    }

    async fn send_pass_through_ports(&self, ports: &[u16]) -> Result<()> {
        let mut state = self.state.lock().await;
        let loaded = state
            .as_mut()
            .ok_or_else(|| KeployError::internal("hooks not loaded"))?;

        if ports.len() > PASS_THROUGH_SLOTS as usize {
            warn!(
                event.name = "hooks.pass_through_truncated",
                configured = ports.len(),
                slots = PASS_THROUGH_SLOTS,
                "too many pass-through ports, extra entries ignored"
            );
        }
        for slot in 0..PASS_THROUGH_SLOTS {
            let value = ports.get(slot as usize).copied().unwrap_or(0);
            loaded.pass_through.set(slot, value, 0).map_err(|e| {
                KeployError::internal(format!("failed to publish pass-through ports: {e}"))
            })?;
        }
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(loaded) = state.take() {
            for pump in &loaded.pumps {
                pump.abort();
            }
            // dropping the Ebpf object detaches every program
            drop(loaded);
            info!(event.name = "hooks.unloaded", "kernel hooks unloaded");
        }
        *self.dest_info.lock().unwrap() = None;
        Ok(())
    }
}

impl DestinationResolver for EbpfHooks {
    fn resolve(&self, src_addr: SocketAddr) -> Option<SocketAddr> {
        let guard = self.dest_info.lock().unwrap();
        let map = guard.as_ref()?;
        let info = map.get(&u32::from(src_addr.port()), 0).ok()?;
        info.to_socket_addr()
    }
}
