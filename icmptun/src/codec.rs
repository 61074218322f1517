//! Wire format for the tunnel's ICMP Echo payload.
//!
//! Every tunnel datagram carries a fixed 18-byte header (a superset of
//! the standard ICMP Echo header, with the destination and a magic
//! discriminant folded in) followed by an opaque stream-payload blob.

use std::net::Ipv4Addr;

use crate::error::{IcmpTunError, Result};

/// 32-bit constant embedded in every tunnel packet. Packets lacking it
/// are unrelated ICMP traffic sharing the raw socket and must be
/// ignored by both engines.
pub const TUNNEL_MAGIC: u32 = 0x2442_6886;

/// Size of the IPv4 header prefix on a received raw-socket datagram,
/// assuming no IP options (the common case, and the one this tunnel
/// requires).
pub const IP_HEADER_SIZE: usize = 20;

/// Size of the fixed ICMP-region prefix: type, code, checksum, id,
/// sequence, destination address, destination port, magic.
pub const ICMP_HEADER_SIZE: usize = 18;

/// Upper bound on a single ICMP datagram this tunnel will read.
pub const ICMP_BUFFER_SIZE: usize = 65_565;

/// Upper bound on a single stream read forwarded as one packet.
pub const STREAM_BUFFER_SIZE: usize = 1_024;

/// The ICMP Echo message type. Only Echo Request/Reply are ever used;
/// any other ICMP type seen on the raw socket is unrelated traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    Request,
    Reply,
}

impl EchoKind {
    const REQUEST: u8 = 8;
    const REPLY: u8 = 0;
}

impl TryFrom<u8> for EchoKind {
    type Error = IcmpTunError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            Self::REQUEST => Ok(EchoKind::Request),
            Self::REPLY => Ok(EchoKind::Reply),
            other => Err(IcmpTunError::BadType(other)),
        }
    }
}

impl From<EchoKind> for u8 {
    fn from(kind: EchoKind) -> Self {
        match kind {
            EchoKind::Request => EchoKind::REQUEST,
            EchoKind::Reply => EchoKind::REPLY,
        }
    }
}

/// The tunnel's own control discriminant, carried in the ICMP `code`
/// field. Unrelated to ICMP's own code semantics for other types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Ordinary stream bytes.
    Data,
    /// Teardown: the originating stream half-closed.
    End,
}

impl Control {
    const DATA: u8 = 0;
    const END: u8 = 1;
}

impl TryFrom<u8> for Control {
    type Error = IcmpTunError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            Self::DATA => Ok(Control::Data),
            Self::END => Ok(Control::End),
            other => Err(IcmpTunError::BadControl(other)),
        }
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        match control {
            Control::Data => Control::DATA,
            Control::End => Control::END,
        }
    }
}

/// A decoded (or about-to-be-encoded) tunnel packet.
///
/// `id` and `sequence` are unused by the protocol today; they are
/// always encoded as zero and never inspected by engine logic, but are
/// kept as real fields so a future revision could use them for session
/// identification without a wire format change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPacket {
    pub kind: EchoKind,
    pub control: Control,
    /// Checksum as read off the wire. Not re-verified by [`decode`];
    /// callers that care about wire integrity recompute it themselves.
    pub checksum: u16,
    pub id: u16,
    pub sequence: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub magic: u32,
    pub payload: Vec<u8>,
    /// Source of the received IP datagram. `None` for a packet built
    /// locally for sending; always `Some` after [`decode`].
    pub src_addr: Option<Ipv4Addr>,
}

impl TunnelPacket {
    /// Build a fresh outgoing packet with the tunnel magic and zeroed
    /// `id`/`sequence`/`checksum` (the checksum is filled in by
    /// [`encode`]).
    pub fn new(kind: EchoKind, control: Control, dst_addr: Ipv4Addr, dst_port: u16, payload: Vec<u8>) -> Self {
        TunnelPacket {
            kind,
            control,
            checksum: 0,
            id: 0,
            sequence: 0,
            dst_addr,
            dst_port,
            magic: TUNNEL_MAGIC,
            payload,
            src_addr: None,
        }
    }

    /// Whether this packet carries the tunnel discriminant. Packets
    /// that decode cleanly but fail this check are unrelated ICMP
    /// traffic and must be ignored.
    pub fn is_tunnel_packet(&self) -> bool {
        self.magic == TUNNEL_MAGIC
    }
}

/// Serialize a packet as the ICMP data region: the fixed header
/// followed by its payload, with the checksum computed over the whole
/// region and written back into the checksum slot.
///
/// The caller sends the result through a raw ICMP socket; the kernel
/// prepends the IP header.
pub fn encode(packet: &TunnelPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ICMP_HEADER_SIZE + packet.payload.len());
    buf.push(u8::from(packet.kind));
    buf.push(u8::from(packet.control));
    buf.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    buf.extend_from_slice(&packet.id.to_be_bytes());
    buf.extend_from_slice(&packet.sequence.to_be_bytes());
    buf.extend_from_slice(&packet.dst_addr.octets());
    buf.extend_from_slice(&packet.dst_port.to_be_bytes());
    buf.extend_from_slice(&packet.magic.to_be_bytes());
    buf.extend_from_slice(&packet.payload);

    let checksum = internet_checksum(&buf);
    buf[2..4].copy_from_slice(&checksum.to_be_bytes());
    buf
}

/// Parse a datagram as received from a raw ICMP socket: a 20-byte IPv4
/// header prefix followed by the ICMP region.
///
/// Does not check `magic`; callers independently compare it against
/// [`TUNNEL_MAGIC`] (see [`TunnelPacket::is_tunnel_packet`]) since
/// unrelated ICMP traffic is expected on the same raw socket.
pub fn decode(datagram: &[u8]) -> Result<TunnelPacket> {
    if datagram.len() < IP_HEADER_SIZE {
        return Err(IcmpTunError::Short {
            need: IP_HEADER_SIZE,
            got: datagram.len(),
        });
    }
    let (ip_header, rest) = datagram.split_at(IP_HEADER_SIZE);
    let src_addr = Ipv4Addr::new(ip_header[12], ip_header[13], ip_header[14], ip_header[15]);

    if rest.len() < ICMP_HEADER_SIZE {
        return Err(IcmpTunError::Short {
            need: ICMP_HEADER_SIZE,
            got: rest.len(),
        });
    }

    let kind = EchoKind::try_from(rest[0])?;
    let control = Control::try_from(rest[1])?;
    let checksum = u16::from_be_bytes([rest[2], rest[3]]);
    let id = u16::from_be_bytes([rest[4], rest[5]]);
    let sequence = u16::from_be_bytes([rest[6], rest[7]]);
    let dst_addr = Ipv4Addr::new(rest[8], rest[9], rest[10], rest[11]);
    let dst_port = u16::from_be_bytes([rest[12], rest[13]]);
    let magic = u32::from_be_bytes([rest[14], rest[15], rest[16], rest[17]]);
    let payload = rest[ICMP_HEADER_SIZE..].to_vec();

    Ok(TunnelPacket {
        kind,
        control,
        checksum,
        id,
        sequence,
        dst_addr,
        dst_port,
        magic,
        payload,
        src_addr: Some(src_addr),
    })
}

/// The canonical 16-bit Internet checksum: a one's-complement sum of
/// 16-bit one's-complement words, big-endian, with a lone trailing
/// byte treated as the high byte of a final zero-padded word.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    sum = (sum & 0xFFFF) + (sum >> 16);
    !(sum as u16)
}
