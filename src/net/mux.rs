//! Thin portability layer over `epoll`/`kqueue` for a single worker thread.
//!
//! Wraps [`mio::Poll`] rather than the raw `libc` FFI — `mio` already
//! provides the edge-triggered `add`/`remove`/`wait` surface this module
//! needs on both Linux and BSD/macOS.

use mio::{event::Source, Events, Interest, Poll, Token};
use std::{io, time::Duration};

/// One multiplexer per worker thread. Not `Send`/`Sync` on purpose — a
/// worker's multiplexer is never touched by any thread but its own.
pub(crate) struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    #[inline]
    pub(crate) fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
        })
    }

    /// Registers `source` for edge-triggered readability under `token`.
    #[inline]
    pub(crate) fn add<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)
    }

    /// Deregisters `source`. Called before the fd is closed or handed off
    /// to another event loop (e.g. the WebSocket subsystem).
    #[inline]
    pub(crate) fn remove<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks up to `timeout` and fills the internal event buffer. Retries
    /// transparently on `EINTR` — a signal arriving mid-wait is not an error.
    pub(crate) fn wait(&mut self, timeout: Duration) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Tokens ready since the last [`wait`](Self::wait) call. The caller
    /// processes every token here before calling `wait` again, so no fd is
    /// starved behind another on the same worker.
    #[inline]
    pub(crate) fn ready_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.events.iter().map(|e| e.token())
    }
}
