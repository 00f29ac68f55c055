//! One accepted socket, its handler and its output queue.
//!
//! Readiness from `mio` is edge-triggered, so a connection latches the
//! readable and writable signals it has seen and clears them only when the
//! socket reports `WouldBlock`. The reactor asks [`Connection::has_work`] to
//! decide whether it may block in `poll` at all.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::event::Event;
use mio::net::TcpStream;

use super::handler::{Handler, OutputQueue};
use super::output::ReadOutcome;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side of the connection.
    PeerClosed,
    /// The handler returned `false` or asked for an immediate close.
    HandlerClosed,
    /// All output was sent and the handler had asked to close after drain.
    Drained,
    /// Receiving from the socket failed.
    ReadError,
    /// Sending to the socket (or reading a file source) failed.
    WriteError,
    /// Internal bookkeeping went wrong; only this connection is dropped.
    Invariant,
    /// The reactor is shutting down.
    Shutdown,
}

pub(crate) struct Connection<H: Handler> {
    id: usize,
    stream: TcpStream,
    peer: SocketAddr,
    handler: H,
    queue: OutputQueue,
    /// Bytes pulled from the head source but not yet accepted by the socket.
    pending: Vec<u8>,
    pending_pos: usize,
    readable: bool,
    writable: bool,
    /// Peer shut down its write side (seen even while reads are paused).
    hung_up: bool,
    closed: Option<CloseReason>,
    bytes_in: u64,
    bytes_out: u64,
}

impl<H: Handler> Connection<H> {
    /// Wraps an accepted socket. Both readiness flags start set so the first
    /// service pass polls the socket without waiting for an edge.
    pub(crate) fn new(id: usize, stream: TcpStream, peer: SocketAddr, handler: H) -> Self {
        Self {
            id,
            stream,
            peer,
            handler,
            queue: OutputQueue::default(),
            pending: Vec::new(),
            pending_pos: 0,
            readable: true,
            writable: true,
            hung_up: false,
            closed: None,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub(crate) fn traffic(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }

    /// Records readiness reported by `poll`.
    pub(crate) fn on_event(&mut self, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.readable = true;
        }
        if event.is_read_closed() || event.is_error() {
            self.hung_up = true;
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            self.writable = true;
        }
    }

    /// Returns true if servicing this connection right now would make
    /// progress, so the reactor must not block.
    pub(crate) fn has_work(&self) -> bool {
        if self.closed.is_some() {
            return true;
        }
        if self.readable && self.wants_read() {
            return true;
        }
        if self.writable && (self.has_pending() || self.queue.head_ready()) {
            return true;
        }
        self.drained_and_closing()
    }

    fn wants_read(&self) -> bool {
        self.closed.is_none() && !self.queue.is_inbound_paused()
    }

    fn has_pending(&self) -> bool {
        self.pending_pos < self.pending.len()
    }

    fn drained_and_closing(&self) -> bool {
        self.queue.is_close_after_drain() && self.queue.is_empty() && !self.has_pending()
    }

    fn close(&mut self, reason: CloseReason) {
        if self.closed.is_none() {
            self.closed = Some(reason);
        }
    }

    /// Runs one iteration for this connection: tick, one read, one write chunk.
    pub(crate) fn service(&mut self, read_buf: &mut [u8], write_chunk: usize) {
        if self.closed.is_some() {
            return;
        }

        self.handler.on_tick(&mut self.queue);
        if self.queue.is_close_now() {
            self.close(CloseReason::HandlerClosed);
            return;
        }

        if self.readable && self.wants_read() {
            self.read_once(read_buf);
        } else if self.hung_up {
            self.on_peer_eof();
        }

        if self.closed.is_none() && self.writable {
            self.write_once(write_chunk);
        }

        if self.closed.is_none() && self.drained_and_closing() {
            self.close(CloseReason::Drained);
        }
    }

    fn read_once(&mut self, buf: &mut [u8]) {
        match self.stream.read(buf) {
            Ok(0) => {
                self.hung_up = true;
                self.on_peer_eof();
            }
            Ok(n) => {
                self.bytes_in += n as u64;
                let keep_open = self.handler.process_inbound(&buf[..n], &mut self.queue);
                if self.queue.is_close_now() {
                    self.close(CloseReason::HandlerClosed);
                } else if !keep_open {
                    if self.queue.is_empty() && !self.has_pending() {
                        self.close(CloseReason::HandlerClosed);
                    } else {
                        self.queue.close_after_drain();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.readable = false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("[Connection] Read from {} failed: {}", self.peer, e);
                self.close(CloseReason::ReadError);
            }
        }
    }

    /// Peer sent FIN. Output that is ready is still flushed; output that is
    /// waiting on a deferred source is abandoned. Re-run on every pass after
    /// the hang-up until the connection closes.
    fn on_peer_eof(&mut self) {
        self.readable = false;
        let nothing_to_flush = self.queue.is_empty() && !self.has_pending();
        let head_parked = !self.has_pending() && !self.queue.is_empty() && !self.queue.head_ready();
        if nothing_to_flush || head_parked {
            self.close(CloseReason::PeerClosed);
        } else {
            self.queue.close_after_drain();
            self.queue.pause_inbound_until_drained();
        }
    }

    fn write_once(&mut self, chunk: usize) {
        if !self.has_pending() && !self.fill_pending(chunk) {
            return;
        }

        loop {
            match self.stream.write(&self.pending[self.pending_pos..]) {
                Ok(0) => {
                    self.close(CloseReason::WriteError);
                    return;
                }
                Ok(n) => {
                    self.bytes_out += n as u64;
                    self.pending_pos += n;
                    if !self.has_pending() {
                        self.pending.clear();
                        self.pending_pos = 0;
                    }
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[Connection] Write to {} failed: {}", self.peer, e);
                    self.close(CloseReason::WriteError);
                    return;
                }
            }
        }
    }

    /// Pulls up to `chunk` bytes from the queue into `pending`, popping
    /// exhausted sources in order. Stops at a source that is not ready.
    /// Returns true if any bytes are now pending.
    fn fill_pending(&mut self, chunk: usize) -> bool {
        self.pending.clear();
        self.pending.resize(chunk, 0);
        self.pending_pos = 0;
        let mut filled = 0;

        while filled < chunk {
            let Some(head) = self.queue.head_mut() else {
                break;
            };
            match head.read_into(&mut self.pending[filled..]) {
                Ok(ReadOutcome::Data(0)) => {
                    debug_assert!(false, "output source returned zero bytes without EOF");
                    self.close(CloseReason::Invariant);
                    break;
                }
                Ok(ReadOutcome::Data(n)) => filled += n,
                Ok(ReadOutcome::NotReady) => break,
                Ok(ReadOutcome::Eof) => self.queue.pop_head(),
                Err(e) => {
                    log::warn!("[Connection] Output source for {} failed: {}", self.peer, e);
                    self.close(CloseReason::WriteError);
                    break;
                }
            }
        }

        self.pending.truncate(filled);
        filled > 0
    }

    /// Final teardown: tells the handler and drops queued output.
    pub(crate) fn finish(&mut self, reason: CloseReason) {
        self.close(reason);
        self.handler.on_close();
        self.queue.clear();
        self.pending.clear();
        self.pending_pos = 0;
    }
}
