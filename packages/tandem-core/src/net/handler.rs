//! The contract between a reactor and a protocol implementation.
//!
//! The reactor owns sockets and buffering; a [`Handler`] owns protocol state
//! for exactly one connection. Handlers never touch the socket. They receive
//! inbound bytes and respond by pushing [`OutputSource`]s into the
//! connection's [`OutputQueue`].

use std::collections::VecDeque;
use std::net::SocketAddr;

use super::output::OutputSource;
use super::reactor::ReactorHandle;

/// Per-connection protocol logic.
///
/// All methods run on the owning reactor's thread and must not block.
pub trait Handler: Send + 'static {
    /// Consumes newly received bytes. Returns `false` to close the connection.
    ///
    /// Closing is graceful by default: queued output is flushed first unless
    /// the handler also called [`OutputQueue::close_now`].
    fn process_inbound(&mut self, bytes: &[u8], out: &mut OutputQueue) -> bool;

    /// Called once per reactor iteration for every live connection.
    ///
    /// Used to move work queued from other threads into the output queue.
    fn on_tick(&mut self, _out: &mut OutputQueue) {}

    /// Called exactly once, just before the connection is dropped.
    fn on_close(&mut self) {}
}

/// Identity of a freshly accepted connection, passed to the factory.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Reactor-unique connection id (never reused within one reactor).
    pub id: usize,
    /// Remote address.
    pub peer: SocketAddr,
    /// Handle to the reactor that owns the connection.
    pub reactor: ReactorHandle,
}

/// Creates one [`Handler`] per accepted connection.
pub trait HandlerFactory: Send + 'static {
    type Handler: Handler;

    fn new_handler(&mut self, ctx: &ConnectionContext) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: FnMut(&ConnectionContext) -> H + Send + 'static,
    H: Handler,
{
    type Handler = H;

    fn new_handler(&mut self, ctx: &ConnectionContext) -> H {
        self(ctx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output Queue
// ─────────────────────────────────────────────────────────────────────────────

/// FIFO of output sources plus the flags a handler uses to steer the
/// connection's lifecycle.
///
/// Only the head source is ever read from; sources behind it are untouched
/// until it is fully drained.
#[derive(Debug, Default)]
pub struct OutputQueue {
    sources: VecDeque<OutputSource>,
    close_after_drain: bool,
    inbound_paused: bool,
    close_now: bool,
}

impl OutputQueue {
    /// Appends a source. Ownership passes to the connection.
    pub fn enqueue(&mut self, source: impl Into<OutputSource>) {
        self.sources.push_back(source.into());
    }

    /// Close the connection once every queued byte has been sent.
    pub fn close_after_drain(&mut self) {
        self.close_after_drain = true;
    }

    /// Stop reading from the peer until the queue is empty.
    ///
    /// Cleared automatically when the last queued source is drained.
    pub fn pause_inbound_until_drained(&mut self) {
        self.inbound_paused = true;
    }

    /// Close the connection at the end of this iteration, discarding any
    /// output that is still queued.
    pub fn close_now(&mut self) {
        self.close_now = true;
    }

    /// Number of queued sources, including a partially drained head.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn is_close_after_drain(&self) -> bool {
        self.close_after_drain
    }

    pub fn is_close_now(&self) -> bool {
        self.close_now
    }

    /// Returns true if inbound reads are suspended.
    pub fn is_inbound_paused(&self) -> bool {
        self.inbound_paused && !self.sources.is_empty()
    }

    /// Returns true if the head source can produce bytes (or EOF) right now.
    pub(crate) fn head_ready(&self) -> bool {
        self.sources.front().is_some_and(OutputSource::is_ready)
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut OutputSource> {
        self.sources.front_mut()
    }

    /// Drops the fully drained head. Clears the inbound pause if that was the
    /// last source.
    pub(crate) fn pop_head(&mut self) {
        self.sources.pop_front();
        if self.sources.is_empty() {
            self.inbound_paused = false;
        }
    }

    /// Drops every queued source (and any notification guards they hold).
    pub(crate) fn clear(&mut self) {
        for source in &mut self.sources {
            source.close();
        }
        self.sources.clear();
        self.inbound_paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_clears_when_queue_drains() {
        let mut queue = OutputQueue::default();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.pause_inbound_until_drained();
        assert!(queue.is_inbound_paused());

        queue.pop_head();
        assert!(queue.is_inbound_paused());
        queue.pop_head();
        assert!(!queue.is_inbound_paused());
        assert!(queue.is_empty());
    }

    #[test]
    fn pause_on_empty_queue_has_no_effect() {
        let mut queue = OutputQueue::default();
        queue.pause_inbound_until_drained();
        assert!(!queue.is_inbound_paused());
    }

    #[test]
    fn head_ready_tracks_deferred_head_only() {
        let mut queue = OutputQueue::default();
        assert!(!queue.head_ready());

        let (pending, completer) = OutputSource::deferred();
        queue.enqueue(pending);
        queue.enqueue("ready but behind");
        assert!(!queue.head_ready());

        completer.complete("now");
        assert!(queue.head_ready());
    }

    #[test]
    fn flags_are_sticky() {
        let mut queue = OutputQueue::default();
        queue.close_after_drain();
        queue.close_now();
        assert!(queue.is_close_after_drain());
        assert!(queue.is_close_now());
        assert_eq!(queue.len(), 0);
    }
}
