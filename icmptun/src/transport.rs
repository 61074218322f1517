//! The raw ICMP socket side of a tunnel engine: a single raw socket
//! that both sends and receives, wrapped behind a small trait so
//! engine logic can be exercised in tests without `CAP_NET_RAW`.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// lowest-priority DSCP, set on outgoing tunnel traffic so it doesn't
/// compete with real interactive pings on a shared link.
const DSCP_LOW_PRIORITY: u32 = 8 << 2;

/// Send and receive raw ICMP datagrams for one engine.
///
/// Implementors receive whole IP datagrams (20-byte header + ICMP
/// region) on `recv_datagram`, matching what a raw `SOCK_RAW`/
/// `IPPROTO_ICMP` socket delivers on Linux, and hand back only the
/// ICMP region (no IP header) to `send_datagram`, since the kernel
/// prepends it on send.
pub trait IcmpTransport {
    fn send_datagram(&mut self, icmp_region: &[u8], dst: Ipv4Addr) -> io::Result<usize>;
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A real raw ICMPv4 socket.
pub struct RawIcmpSocket {
    socket: Socket,
}

impl RawIcmpSocket {
    /// Create a nonblocking raw ICMPv4 socket. Requires `CAP_NET_RAW`
    /// or root; callers should log a hint about that before
    /// propagating the resulting `io::Error`.
    pub fn new() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_tos(DSCP_LOW_PRIORITY)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl IcmpTransport for RawIcmpSocket {
    fn send_datagram(&mut self, icmp_region: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        // Port is ignored at the raw layer; 0 only satisfies SocketAddr's shape.
        let addr = SocketAddr::V4(SocketAddrV4::new(dst, 0));
        self.socket.send_to(icmp_region, &SockAddr::from(addr))
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }
}

impl AsRawFd for RawIcmpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
