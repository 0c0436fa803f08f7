#![cfg_attr(not(test), no_std)]
//! Shared socket-event structures between the eBPF hooks and userspace.
//!
//! The kernel side of the agent watches the target application's sockets and
//! publishes three event kinds into a ring buffer: open, data, and close.
//! This crate defines those records with `#[repr(C)]` so the byte layout the
//! eBPF object writes is exactly the layout userspace reads back.
//!
//! # Key Types
//!
//! - [`ConnId`]: identity of one socket for the life of that socket
//! - [`SocketOpenEvent`] / [`SocketDataEvent`] / [`SocketCloseEvent`]: the
//!   ring-buffer records
//! - [`TrafficDirection`]: which way the payload of a data event flowed
//!
//! # Memory Layout Requirements
//!
//! Field order and sizes must match the eBPF object file. Changing them
//! breaks kernel/userspace compatibility.

use core::fmt;
use core::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Maximum payload carried by a single [`SocketDataEvent`]. Larger writes are
/// split into multiple events by the kernel side; `msg_size` still reports the
/// full size of the original syscall.
pub const EVENT_BODY_MAX_SIZE: usize = 16384;

/// Identity of one socket, unique for the socket's lifetime.
///
/// File descriptors are reused by the kernel; the open timestamp
/// disambiguates two sockets that happened to get the same fd in the same
/// process.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct ConnId {
    /// Thread-group id (pid) of the traced process.
    pub tgid: u32,
    /// File descriptor number inside that process.
    pub fd: i32,
    /// Kernel timestamp of the socket open, in nanoseconds.
    pub opened_ns: u64,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.tgid, self.fd, self.opened_ns)
    }
}

/// Which way the payload of a [`SocketDataEvent`] flowed, from the traced
/// application's point of view.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrafficDirection {
    /// Application wrote to the peer (request direction).
    Egress = 0,
    /// Application read from the peer (response direction).
    Ingress = 1,
}

/// IPv4 peer address as captured at `connect`/`accept` time.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SockAddrIn {
    pub sin_family: u16,
    /// Port in network byte order.
    pub sin_port: u16,
    /// Address in network byte order.
    pub sin_addr: u32,
}

impl SockAddrIn {
    /// Convert to a `SocketAddr`, decoding the network-byte-order fields.
    pub fn to_socket_addr(&self) -> SocketAddr {
        let ip = Ipv4Addr::from(u32::from_be(self.sin_addr));
        SocketAddr::new(IpAddr::V4(ip), u16::from_be(self.sin_port))
    }
}

/// Emitted when the traced application opens a socket.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SocketOpenEvent {
    pub timestamp_ns: u64,
    pub conn_id: ConnId,
    pub addr: SockAddrIn,
}

/// Emitted for every read/write the traced application performs on a tracked
/// socket. `msg` holds at most [`EVENT_BODY_MAX_SIZE`] bytes of the payload.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SocketDataEvent {
    pub timestamp_ns: u64,
    pub conn_id: ConnId,
    pub direction: TrafficDirection,
    /// Size of the original syscall payload (may exceed the captured bytes).
    pub msg_size: u32,
    /// Running byte count the kernel has validated for the read side.
    pub validate_read_bytes: u64,
    /// Running byte count the kernel has validated for the write side.
    pub validate_written_bytes: u64,
    pub msg: [u8; EVENT_BODY_MAX_SIZE],
}

impl SocketDataEvent {
    /// The captured payload slice, clamped to the event body capacity.
    pub fn payload(&self) -> &[u8] {
        let len = (self.msg_size as usize).min(EVENT_BODY_MAX_SIZE);
        &self.msg[..len]
    }
}

impl fmt::Debug for SocketDataEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketDataEvent")
            .field("timestamp_ns", &self.timestamp_ns)
            .field("conn_id", &self.conn_id)
            .field("direction", &self.direction)
            .field("msg_size", &self.msg_size)
            .finish_non_exhaustive()
    }
}

/// Emitted when the traced application closes a socket.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SocketCloseEvent {
    pub timestamp_ns: u64,
    pub conn_id: ConnId,
}

/// Proxy endpoint published to the kernel so redirected connects land on it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProxyInfo {
    /// IPv4 address in network byte order.
    pub ip4: u32,
    /// IPv6 address as four network-byte-order words.
    pub ip6: [u32; 4],
    pub port: u32,
}

/// Original destination of a redirected connect, stored by the kernel keyed
/// by the redirected connection's source port.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DestInfo {
    /// 4 or 6.
    pub ip_version: u32,
    pub dest_ip4: u32,
    pub dest_ip6: [u32; 4],
    pub dest_port: u32,
}

impl DestInfo {
    /// Decode into a `SocketAddr`, interpreting the stored words as
    /// network byte order.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let port = u16::try_from(self.dest_port).ok()?;
        match self.ip_version {
            4 => {
                let ip = Ipv4Addr::from(u32::from_be(self.dest_ip4));
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
            6 => {
                let mut octets = [0u8; 16];
                for (i, word) in self.dest_ip6.iter().enumerate() {
                    octets[i * 4..i * 4 + 4].copy_from_slice(&word.to_ne_bytes());
                }
                Some(SocketAddr::new(
                    IpAddr::V6(core::net::Ipv6Addr::from(octets)),
                    port,
                ))
            }
            _ => None,
        }
    }
}

// Userspace side passes these through aya maps verbatim.
#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for ConnId {}
    unsafe impl aya::Pod for SockAddrIn {}
    unsafe impl aya::Pod for ProxyInfo {}
    unsafe impl aya::Pod for DestInfo {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_decodes_network_byte_order() {
        let addr = SockAddrIn {
            sin_family: 2,
            sin_port: 8080u16.to_be(),
            sin_addr: u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_be(),
        };
        let sa = addr.to_socket_addr();
        assert_eq!(sa.port(), 8080);
        assert_eq!(sa.ip(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn conn_id_distinguishes_reused_fds() {
        let first = ConnId {
            tgid: 100,
            fd: 7,
            opened_ns: 1,
        };
        let reused = ConnId {
            tgid: 100,
            fd: 7,
            opened_ns: 2,
        };
        assert_ne!(first, reused);
    }

    #[test]
    fn data_event_payload_clamps_to_capacity() {
        let mut event = SocketDataEvent {
            timestamp_ns: 0,
            conn_id: ConnId::default(),
            direction: TrafficDirection::Egress,
            msg_size: (EVENT_BODY_MAX_SIZE + 100) as u32,
            validate_read_bytes: 0,
            validate_written_bytes: 0,
            msg: [0u8; EVENT_BODY_MAX_SIZE],
        };
        event.msg[0] = 0x47;
        assert_eq!(event.payload().len(), EVENT_BODY_MAX_SIZE);
        assert_eq!(event.payload()[0], 0x47);
    }
}
