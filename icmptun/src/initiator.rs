//! The client side of the tunnel: a local TCP proxy that accepts one
//! inbound stream connection and relays it as ICMP Echo Requests to a
//! responder, mirroring its Echo Replies back to the stream.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{info, trace};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::codec::{self, Control, EchoKind, TunnelPacket, ICMP_BUFFER_SIZE, STREAM_BUFFER_SIZE};
use crate::error::Result;
use crate::readiness::{ReadinessLoop, ICMP_TOKEN, STREAM_TOKEN};
use crate::transport::IcmpTransport;

/// Phase A: waits for exactly one inbound TCP connection, then hands
/// it to a [`ClientEngine`] for Phase B.
pub struct ClientProxy {
    listener: TcpListener,
    proxy_addr: Ipv4Addr,
    dst: SocketAddrV4,
}

impl ClientProxy {
    /// Bind a listening socket on `local` with address-reuse enabled,
    /// as a plain `std::net::TcpListener::bind` would not guarantee.
    pub fn bind(local: SocketAddrV4, proxy_addr: Ipv4Addr, dst: SocketAddrV4) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(SocketAddr::V4(local)))?;
        socket.listen(1)?;
        let listener: TcpListener = socket.into();
        info!("listening for one inbound connection on {local}");
        Ok(Self {
            listener,
            proxy_addr,
            dst,
        })
    }

    /// Accept the single inbound connection this proxy will ever
    /// serve, and build the Phase B relay engine around it.
    pub fn accept<I: IcmpTransport>(self, icmp: I) -> io::Result<ClientEngine<I>> {
        let (stream, peer) = self.listener.accept()?;
        info!("accepted inbound stream from {peer}");
        Ok(ClientEngine {
            stream,
            icmp,
            proxy_addr: self.proxy_addr,
            dst: self.dst,
            terminated: false,
        })
    }
}

/// Phase B: relays bytes between the accepted stream and the raw ICMP
/// socket until the stream half-closes.
pub struct ClientEngine<I: IcmpTransport> {
    stream: TcpStream,
    icmp: I,
    proxy_addr: Ipv4Addr,
    dst: SocketAddrV4,
    terminated: bool,
}

impl<I: IcmpTransport> ClientEngine<I> {
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Handle one ready read on the stream: read up to the stream
    /// buffer budget and emit the corresponding Echo Request. Returns
    /// `true` exactly when this was the terminal END send.
    pub fn on_stream_readable(&mut self) -> Result<bool> {
        let mut buf = [0u8; STREAM_BUFFER_SIZE];
        let n = self.stream.read(&mut buf)?;
        let control = if n == 0 { Control::End } else { Control::Data };

        let packet = TunnelPacket::new(EchoKind::Request, control, *self.dst.ip(), self.dst.port(), buf[..n].to_vec());
        let wire = codec::encode(&packet);
        self.icmp.send_datagram(&wire, self.proxy_addr)?;

        if control == Control::End {
            self.terminated = true;
            info!("stream closed, sent teardown to {}", self.proxy_addr);
        }
        Ok(self.terminated)
    }

    /// Handle one ready read on the ICMP socket: decode, validate the
    /// tunnel magic, and mirror Echo Replies to the stream. Echo
    /// Requests are always our own traffic looped back (or a foreign
    /// probe) and must never be forwarded.
    pub fn on_icmp_readable(&mut self) -> Result<()> {
        let mut buf = vec![0u8; ICMP_BUFFER_SIZE];
        let n = self.icmp.recv_datagram(&mut buf)?;

        let packet = match codec::decode(&buf[..n]) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("dropping unparsable ICMP datagram: {err}");
                return Ok(());
            }
        };
        if !packet.is_tunnel_packet() {
            trace!("dropping non-tunnel ICMP datagram (magic {:#010x})", packet.magic);
            return Ok(());
        }
        if packet.kind == EchoKind::Request {
            trace!("ignoring Echo Request (self-echo or foreign probe)");
            return Ok(());
        }

        self.stream.write_all(&packet.payload)?;
        Ok(())
    }
}

impl<I: IcmpTransport + AsRawFd> ClientEngine<I> {
    /// Relay until the stream half-closes, then return so the caller
    /// can exit the process with status 0.
    pub fn run(&mut self) -> Result<()> {
        let mut readiness = ReadinessLoop::new(self.icmp.as_raw_fd())?;
        readiness.register_stream(self.stream.as_raw_fd())?;

        loop {
            for token in readiness.wait()? {
                match token {
                    ICMP_TOKEN => self.on_icmp_readable()?,
                    STREAM_TOKEN => {
                        if self.on_stream_readable()? {
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
