//! Shared backend for tunneling a bidirectional byte stream over raw
//! ICMP Echo messages: the wire codec, the two peer engines
//! (initiator and responder), and the error types they share.
//!
//! See the `icmptun-client` and `icmptun-server` binaries for the
//! thin CLI wrappers around [`initiator::ClientProxy`] and
//! [`responder::ResponderEngine`].

pub mod codec;
pub mod error;
pub mod initiator;
mod readiness;
pub mod responder;
pub mod transport;

pub use codec::{Control, EchoKind, TunnelPacket, TUNNEL_MAGIC};
pub use error::{IcmpTunError, Result};
pub use initiator::{ClientEngine, ClientProxy};
pub use responder::ResponderEngine;
pub use transport::{IcmpTransport, RawIcmpSocket};
