//! Error types shared by the wire codec and both engines.

use std::io;

/// Everything that can go wrong building or driving a tunnel.
///
/// `Io` subsumes socket creation, bind, accept, and stream read/write
/// failures: at the Rust API boundary those are all a plain
/// [`io::Error`], and call sites decide fatal-vs-recoverable by where
/// the error occurred rather than by its Rust type.
#[derive(Debug, thiserror::Error)]
pub enum IcmpTunError {
    #[error("short ICMP datagram: need at least {need} bytes, got {got}")]
    Short { need: usize, got: usize },
    #[error("invalid ICMP type byte: {0:#04x}")]
    BadType(u8),
    #[error("invalid control byte: {0:#04x}")]
    BadControl(u8),
    #[error("unexpected tunnel magic: {0:#010x}")]
    BadMagic(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, IcmpTunError>;
