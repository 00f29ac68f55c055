//! Single-threaded, non-blocking connection multiplexer.
//!
//! Each protocol server runs one [`Reactor`] on its own thread. The reactor
//! owns the listening socket and every live [`Connection`]; nothing inside it
//! is shared with other threads except the [`ReactorHandle`], which carries
//! the stop flag, the `mio::Waker` and a few counters.
//!
//! One iteration ([`Reactor::turn`]):
//!
//! 1. Wait for readiness. The wait is zero if any connection can make
//!    progress without new readiness, otherwise the configured poll timeout.
//!    The bound on that timeout is what guarantees cross-thread state changes
//!    are observed even when a wake-up is lost.
//! 2. Accept everything pending on the listener. Sockets beyond capacity are
//!    accepted and dropped immediately.
//! 3. Service every existing connection: tick, one read, one write chunk.
//! 4. Drop closed connections.
//! 5. Register the connections accepted in step 2. They are never serviced in
//!    the iteration that accepted them.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::connection::{CloseReason, Connection};
use super::handler::{ConnectionContext, HandlerFactory};
use super::listener::bind_listener;
use crate::config::ReactorConfig;
use crate::error::ServerError;
use crate::protocol_constants::EVENTS_CAPACITY;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct HandleInner {
    name: String,
    local_addr: SocketAddr,
    stop: AtomicBool,
    waker: Waker,
    live: AtomicUsize,
    accepted: AtomicU64,
    refused: AtomicU64,
    iterations: AtomicU64,
}

/// Thread-safe handle to a running (or not yet started) reactor.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    inner: Arc<HandleInner>,
}

/// Point-in-time counters for one reactor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    pub live_connections: usize,
    pub accepted: u64,
    pub refused: u64,
    pub iterations: u64,
}

impl ReactorHandle {
    /// Name used in log lines and the thread name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Address the listener is bound to (with the real port if 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Interrupts the reactor's readiness wait.
    pub fn wake(&self) {
        if let Err(e) = self.inner.waker.wake() {
            log::trace!("[Reactor:{}] Wake failed: {}", self.inner.name, e);
        }
    }

    /// Asks the reactor to exit after its current iteration.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReactorStats {
        ReactorStats {
            live_connections: self.inner.live.load(Ordering::Relaxed),
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            refused: self.inner.refused.load(Ordering::Relaxed),
            iterations: self.inner.iterations.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reactor
// ─────────────────────────────────────────────────────────────────────────────

/// Event loop serving one listening socket.
pub struct Reactor<F: HandlerFactory> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    factory: F,
    connections: HashMap<Token, Connection<F::Handler>>,
    next_id: usize,
    config: ReactorConfig,
    handle: ReactorHandle,
    read_buf: Vec<u8>,
}

impl<F: HandlerFactory> Reactor<F> {
    /// Binds the listener described by `config` and prepares the poll registry.
    ///
    /// The reactor does nothing until [`run`](Self::run) or
    /// [`spawn`](Self::spawn) is called, but its [`ReactorHandle`] is usable
    /// immediately.
    pub fn bind(name: &str, config: &ReactorConfig, factory: F) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let mut listener = bind_listener(config.socket_addr())?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.socket_addr(),
            source,
        })?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(ServerError::Poll)?;

        let handle = ReactorHandle {
            inner: Arc::new(HandleInner {
                name: name.to_string(),
                local_addr,
                stop: AtomicBool::new(false),
                waker,
                live: AtomicUsize::new(0),
                accepted: AtomicU64::new(0),
                refused: AtomicU64::new(0),
                iterations: AtomicU64::new(0),
            }),
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            factory,
            connections: HashMap::new(),
            next_id: FIRST_CONNECTION,
            config: config.clone(),
            handle,
            read_buf: vec![0; config.read_chunk],
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Runs the reactor on a new thread named `tandem-<name>`.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("tandem-{}", self.handle.name()))
            .spawn(move || self.run())
    }

    /// Runs until [`ReactorHandle::stop`] is called.
    pub fn run(mut self) {
        log::info!(
            "[Reactor:{}] Listening on {} (max {} connections, poll timeout {}ms)",
            self.handle.name(),
            self.handle.local_addr(),
            self.config.max_connections,
            self.config.poll_timeout_ms
        );

        while !self.handle.is_stopped() {
            self.turn();
        }

        self.shutdown();
        log::info!("[Reactor:{}] Stopped", self.handle.name());
    }

    /// Runs one iteration of the loop.
    pub(crate) fn turn(&mut self) {
        let name = &self.handle.inner.name;
        let busy = self.connections.values().any(Connection::has_work);
        let timeout = if busy {
            Duration::ZERO
        } else {
            self.config.poll_timeout()
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                log::trace!("[Reactor:{}] Poll interrupted, retrying", name);
            } else {
                log::warn!("[Reactor:{}] Poll failed: {}", name, e);
            }
            return;
        }
        self.handle.inner.iterations.fetch_add(1, Ordering::Relaxed);

        let mut listener_ready = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER => listener_ready = true,
                WAKER => log::trace!("[Reactor:{}] Woken", name),
                token => {
                    if let Some(conn) = self.connections.get_mut(&token) {
                        conn.on_event(event);
                    }
                }
            }
        }
        if self.events.is_empty() && !busy {
            log::trace!("[Reactor:{}] Poll timed out", name);
        }

        let accepted = if listener_ready {
            self.accept_pending()
        } else {
            Vec::new()
        };

        let write_chunk = self.config.write_chunk;
        for conn in self.connections.values_mut() {
            conn.service(&mut self.read_buf, write_chunk);
        }

        self.remove_closed();

        for (stream, peer) in accepted {
            self.register(stream, peer);
        }

        self.handle
            .inner
            .live
            .store(self.connections.len(), Ordering::Relaxed);
    }

    /// Accepts until the listener would block. Returns the sockets that fit
    /// under the capacity; the rest are dropped (closed) here.
    fn accept_pending(&mut self) -> Vec<(TcpStream, SocketAddr)> {
        let name = &self.handle.inner.name;
        let mut accepted = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() + accepted.len() >= self.config.max_connections {
                        self.handle.inner.refused.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[Reactor:{}] At capacity, refusing {}", name, peer);
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        log::trace!("[Reactor:{}] set_nodelay on {} failed: {}", name, peer, e);
                    }
                    accepted.push((stream, peer));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[Reactor:{}] Accept failed: {}", name, e);
                    break;
                }
            }
        }

        accepted
    }

    fn register(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        let token = Token(id);

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::warn!(
                "[Reactor:{}] Failed to register {}: {}",
                self.handle.name(),
                peer,
                e
            );
            return;
        }

        let ctx = ConnectionContext {
            id,
            peer,
            reactor: self.handle.clone(),
        };
        let handler = self.factory.new_handler(&ctx);
        self.connections
            .insert(token, Connection::new(id, stream, peer, handler));
        self.handle.inner.accepted.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[Reactor:{}] Accepted connection {} from {}",
            self.handle.name(),
            id,
            peer
        );
    }

    fn remove_closed(&mut self) {
        let closed: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(token, _)| *token)
            .collect();

        for token in closed {
            if let Some(mut conn) = self.connections.remove(&token) {
                let reason = conn.close_reason().unwrap_or(CloseReason::Invariant);
                self.release(&mut conn, reason);
            }
        }
    }

    fn release(&self, conn: &mut Connection<F::Handler>, reason: CloseReason) {
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            log::trace!("[Reactor:{}] Deregister failed: {}", self.handle.name(), e);
        }
        conn.finish(reason);
        let (bytes_in, bytes_out) = conn.traffic();
        match reason {
            CloseReason::ReadError | CloseReason::WriteError | CloseReason::Invariant => {
                log::debug!(
                    "[Reactor:{}] Connection {} ({}) closed on error: {:?}",
                    self.handle.name(),
                    conn.id(),
                    conn.peer(),
                    reason
                )
            }
            _ => log::debug!(
                "[Reactor:{}] Connection {} ({}) closed: {:?}, {} bytes in, {} bytes out",
                self.handle.name(),
                conn.id(),
                conn.peer(),
                reason,
                bytes_in,
                bytes_out
            ),
        }
    }

    fn shutdown(&mut self) {
        let connections: Vec<_> = self.connections.drain().collect();
        for (_, mut conn) in connections {
            self.release(&mut conn, CloseReason::Shutdown);
        }
        self.handle.inner.live.store(0, Ordering::Relaxed);
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            log::trace!("[Reactor:{}] Listener deregister failed: {}", self.handle.name(), e);
        }
    }
}
