//! The server side of the tunnel: waits for ICMP Echo Requests, opens
//! an outbound stream connection to the embedded destination on the
//! first one, and relays bytes both ways until a teardown request
//! arrives.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, info, trace, warn};

use crate::codec::{self, Control, EchoKind, TunnelPacket, ICMP_BUFFER_SIZE, STREAM_BUFFER_SIZE};
use crate::error::Result;
use crate::readiness::{ReadinessLoop, ICMP_TOKEN, STREAM_TOKEN};
use crate::transport::IcmpTransport;

/// Idle/Active state machine for one relay session at a time.
/// `stream` being `Some` is exactly the Active state; `None` is Idle.
pub struct ResponderEngine<I: IcmpTransport> {
    icmp: I,
    peer_addr: Option<Ipv4Addr>,
    dst: Option<SocketAddrV4>,
    stream: Option<TcpStream>,
    /// Streams retired by [`close_stream`](Self::close_stream) since
    /// `run()` last drained them. Kept alive (not dropped) until
    /// `run()` has deregistered their fd from the readiness loop, so
    /// the fd is never closed before `deregister_stream` runs on it.
    closed_streams: Vec<TcpStream>,
}

impl<I: IcmpTransport> ResponderEngine<I> {
    pub fn new(icmp: I) -> Self {
        Self {
            icmp,
            peer_addr: None,
            dst: None,
            stream: None,
            closed_streams: Vec::new(),
        }
    }

    pub fn peer_addr(&self) -> Option<Ipv4Addr> {
        self.peer_addr
    }

    pub fn dst(&self) -> Option<SocketAddrV4> {
        self.dst
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Handle one ready read on the raw ICMP socket: decode, validate
    /// the tunnel magic, and dispatch on (type, code) per the
    /// responder's state table.
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

        let peer = packet.src_addr.expect("decode always fills src_addr");
        self.peer_addr = Some(peer);
        let new_dst = SocketAddrV4::new(packet.dst_addr, packet.dst_port);

        match (packet.kind, packet.control) {
            (EchoKind::Reply, _) => {
                trace!("ignoring echoed/foreign Echo Reply from {peer}");
            }
            (EchoKind::Request, Control::End) => {
                self.close_stream();
                self.dst = Some(new_dst);
                info!("client {peer} closed, returning to idle");
            }
            (EchoKind::Request, Control::Data) => {
                if self.stream.is_some() && self.dst != Some(new_dst) {
                    debug!("destination changed mid-session ({:?} -> {new_dst}), reconnecting", self.dst);
                    self.close_stream();
                }
                self.dst = Some(new_dst);

                if self.stream.is_none() && !packet.payload.is_empty() {
                    match TcpStream::connect(new_dst) {
                        Ok(stream) => {
                            info!("client {peer} joined, opened stream to {new_dst}");
                            self.stream = Some(stream);
                        }
                        Err(err) => {
                            warn!("failed to connect to {new_dst} for client {peer}: {err}");
                            return Ok(());
                        }
                    }
                }

                if !packet.payload.is_empty() {
                    if let Some(stream) = self.stream.as_mut() {
                        if let Err(err) = stream.write_all(&packet.payload) {
                            warn!("stream write to {new_dst} failed, dropping session: {err}");
                            self.close_stream();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle one ready read on the stream socket: mirror up to the
    /// stream buffer budget back as a single Echo Reply. A zero-byte
    /// read (peer half-close) is forwarded as an empty DATA reply;
    /// the responder never originates END itself.
    pub fn on_stream_readable(&mut self) -> Result<()> {
        let (peer, dst) = match (self.peer_addr, self.dst) {
            (Some(peer), Some(dst)) => (peer, dst),
            _ => return Ok(()),
        };
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let mut buf = [0u8; STREAM_BUFFER_SIZE];
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                warn!("stream read from {dst} failed, dropping session: {err}");
                self.close_stream();
                return Ok(());
            }
        };

        let reply = TunnelPacket::new(EchoKind::Reply, Control::Data, *dst.ip(), dst.port(), buf[..n].to_vec());
        let wire = codec::encode(&reply);
        self.icmp.send_datagram(&wire, peer)?;
        Ok(())
    }

    /// Retire the current stream without closing its fd yet: `run()`
    /// must deregister the fd from the readiness loop before the last
    /// handle to it is dropped, so the (now former) stream is parked
    /// in `closed_streams` for `run()` to drain after deregistering.
    fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.closed_streams.push(stream);
        }
    }
}

impl<I: IcmpTransport + AsRawFd> ResponderEngine<I> {
    /// Block forever, accepting and relaying one tunnel session after
    /// another. Fatal raw-socket errors propagate to the caller;
    /// per-packet and per-stream errors are handled internally.
    pub fn run(&mut self) -> Result<()> {
        let mut readiness = ReadinessLoop::new(self.icmp.as_raw_fd())?;
        let mut registered_fd: Option<RawFd> = None;

        loop {
            for token in readiness.wait()? {
                match token {
                    ICMP_TOKEN => self.on_icmp_readable()?,
                    STREAM_TOKEN => self.on_stream_readable()?,
                    _ => {}
                }
            }

            // Deregister each retired stream's fd before it is dropped (and
            // so its fd closed), per ReadinessLoop::deregister_stream's
            // ordering requirement. A single batch of events can retire more
            // than one stream (e.g. a destination change closes the old
            // stream, then a write to the freshly reopened one fails), so
            // drain all of them rather than assuming at most one.
            for closed in self.closed_streams.drain(..) {
                let closed_fd = closed.as_raw_fd();
                if registered_fd == Some(closed_fd) {
                    readiness.deregister_stream(closed_fd)?;
                    registered_fd = None;
                }
                drop(closed);
            }

            let current_fd = self.stream.as_ref().map(TcpStream::as_raw_fd);
            if current_fd != registered_fd {
                if let Some(old_fd) = registered_fd.take() {
                    readiness.deregister_stream(old_fd)?;
                }
                if let Some(new_fd) = current_fd {
                    readiness.register_stream(new_fd)?;
                }
                registered_fd = current_fd;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener};

    use super::*;
    use crate::codec::{encode, TUNNEL_MAGIC};
    use crate::transport::fake::FakeIcmpTransport;

    fn request(control: Control, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
        let packet = TunnelPacket::new(EchoKind::Request, control, *dst.ip(), dst.port(), payload.to_vec());
        encode(&packet)
    }

    fn datagram_from(icmp_region: &[u8], src: Ipv4Addr) -> Vec<u8> {
        let mut datagram = vec![0u8; 20];
        datagram[12..16].copy_from_slice(&src.octets());
        datagram.extend_from_slice(icmp_region);
        datagram
    }

    #[test]
    fn opens_stream_on_first_data_request() {
        let destination = TcpListener::bind("127.0.0.1:0").unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), destination.local_addr().unwrap().port());

        let mut engine = ResponderEngine::new(FakeIcmpTransport::new());
        let icmp_region = request(Control::Data, dst, b"GET\n");
        engine
            .icmp
            .push_incoming(datagram_from(&icmp_region, Ipv4Addr::new(10, 0, 0, 100)));

        assert!(!engine.is_active());
        engine.on_icmp_readable().unwrap();
        assert!(engine.is_active());
        assert_eq!(engine.peer_addr(), Some(Ipv4Addr::new(10, 0, 0, 100)));
        assert_eq!(engine.dst(), Some(dst));

        let (mut accepted, _) = destination.accept().unwrap();
        let mut got = [0u8; 4];
        accepted.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"GET\n");
    }

    #[test]
    fn reply_path_wraps_stream_bytes_as_echo_reply() {
        let destination = TcpListener::bind("127.0.0.1:0").unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), destination.local_addr().unwrap().port());

        let mut engine = ResponderEngine::new(FakeIcmpTransport::new());
        let icmp_region = request(Control::Data, dst, b"GET\n");
        engine
            .icmp
            .push_incoming(datagram_from(&icmp_region, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();

        let (mut accepted, _) = destination.accept().unwrap();
        let mut discard = [0u8; 4];
        accepted.read_exact(&mut discard).unwrap();
        accepted.write_all(b"HTTP/1.0 200 OK\r\n").unwrap();

        engine.on_stream_readable().unwrap();

        assert_eq!(engine.icmp.sent.len(), 1);
        let (wire, dst_sent) = &engine.icmp.sent[0];
        assert_eq!(*dst_sent, Ipv4Addr::new(10, 0, 0, 100));
        let decoded = codec::decode(&datagram_from(wire, Ipv4Addr::new(0, 0, 0, 0))).unwrap();
        assert_eq!(decoded.kind, EchoKind::Reply);
        assert_eq!(decoded.control, Control::Data);
        assert_eq!(decoded.payload, b"HTTP/1.0 200 OK\r\n");
        assert_eq!(decoded.magic, TUNNEL_MAGIC);
    }

    #[test]
    fn teardown_closes_stream_and_returns_to_idle() {
        let destination = TcpListener::bind("127.0.0.1:0").unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), destination.local_addr().unwrap().port());

        let mut engine = ResponderEngine::new(FakeIcmpTransport::new());
        let open = request(Control::Data, dst, b"hi");
        engine.icmp.push_incoming(datagram_from(&open, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();
        assert!(engine.is_active());

        let end = request(Control::End, dst, b"");
        engine.icmp.push_incoming(datagram_from(&end, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();
        assert!(!engine.is_active());
    }

    /// `close_stream` must not drop the retired stream's fd on the spot:
    /// `run()` needs it alive until it has deregistered the fd from the
    /// readiness loop, or `deregister_stream` sees an already-closed fd.
    #[test]
    fn close_stream_parks_the_retired_stream_for_run_to_drain() {
        let destination = TcpListener::bind("127.0.0.1:0").unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), destination.local_addr().unwrap().port());

        let mut engine = ResponderEngine::new(FakeIcmpTransport::new());
        let open = request(Control::Data, dst, b"hi");
        engine.icmp.push_incoming(datagram_from(&open, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();
        assert!(engine.closed_streams.is_empty());

        let end = request(Control::End, dst, b"");
        engine.icmp.push_incoming(datagram_from(&end, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();

        assert!(!engine.is_active());
        assert_eq!(engine.closed_streams.len(), 1);
    }

    #[test]
    fn idempotent_end_leaves_engine_idle() {
        let mut engine = ResponderEngine::new(FakeIcmpTransport::new());
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 80);
        let end = request(Control::End, dst, b"");

        engine.icmp.push_incoming(datagram_from(&end, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();
        assert!(!engine.is_active());

        engine.icmp.push_incoming(datagram_from(&end, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();
        assert!(!engine.is_active());
    }

    #[test]
    fn noise_with_wrong_magic_is_ignored() {
        let mut engine = ResponderEngine::new(FakeIcmpTransport::new());
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 80);
        let mut packet = TunnelPacket::new(EchoKind::Request, Control::Data, *dst.ip(), dst.port(), b"hi".to_vec());
        packet.magic = 0xDEAD_BEEF;
        let wire = encode(&packet);

        engine.icmp.push_incoming(datagram_from(&wire, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();

        assert!(!engine.is_active());
        assert!(engine.peer_addr().is_none());
        assert!(engine.icmp.sent.is_empty());
    }

    #[test]
    fn empty_data_request_does_not_open_a_connection() {
        let mut engine = ResponderEngine::new(FakeIcmpTransport::new());
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 80);
        let empty = request(Control::Data, dst, b"");

        engine.icmp.push_incoming(datagram_from(&empty, Ipv4Addr::new(10, 0, 0, 100)));
        engine.on_icmp_readable().unwrap();

        assert!(!engine.is_active());
    }
}
