//! Shared readiness loop: a level-triggered wait over the raw ICMP
//! socket and, when present, the stream socket.
//!
//! Both engines watch at most two descriptors, so a single
//! `mio::Poll` instance keyed by a fixed pair of tokens stands in for
//! the tagged `Watched { Icmp, Stream }` enum the design calls for —
//! dispatch on which token fired is the tag check.

use std::io;
use std::os::unix::io::RawFd;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

pub const ICMP_TOKEN: Token = Token(0);
pub const STREAM_TOKEN: Token = Token(1);

pub struct ReadinessLoop {
    poll: Poll,
    events: Events,
}

impl ReadinessLoop {
    /// Create the loop and register the raw ICMP socket, which is
    /// always present for the lifetime of an engine.
    pub fn new(icmp_fd: RawFd) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&icmp_fd), ICMP_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(4),
        })
    }

    pub fn register_stream(&mut self, stream_fd: RawFd) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&stream_fd), STREAM_TOKEN, Interest::READABLE)
    }

    /// Drop the stream socket from the watch set. Must be called
    /// before the underlying fd is closed: this process is
    /// single-threaded and nothing else opens sockets between a close
    /// and its matching deregister, so there is no fd-reuse race in
    /// practice even though this call takes the fd by number.
    pub fn deregister_stream(&mut self, stream_fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&stream_fd))
    }

    /// Block until at least one registered socket is readable and
    /// return the tokens that fired. Ordering within a batch is
    /// unspecified and callers must not depend on it.
    pub fn wait(&mut self) -> io::Result<Vec<Token>> {
        self.poll.poll(&mut self.events, None)?;
        Ok(self.events.iter().map(|event| event.token()).collect())
    }
}
