//! Cross-thread wake-up of a reactor blocked in `poll`.
//!
//! Two mechanisms are supported:
//!
//! - [`WakeMode::Waker`]: a `mio::Waker` registered on the reactor's own
//!   poll registry. One syscall, no socket.
//! - [`WakeMode::Loopback`]: connect to the reactor's listening socket and
//!   drop the connection. The listener becomes readable, the reactor accepts,
//!   sees EOF and closes. Works with any readiness API that watches sockets.
//!
//! Both are liveness aids. A lost wake only delays observation until the
//! reactor's poll timeout expires.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::net::TcpStream;
use serde::{Deserialize, Serialize};

use super::reactor::ReactorHandle;

/// How the coordinator interrupts a reactor's readiness wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeMode {
    /// `mio::Waker` on the reactor's poll registry.
    #[default]
    Waker,
    /// Self-connect to the reactor's listening port.
    Loopback,
}

impl std::fmt::Display for WakeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waker => write!(f, "waker"),
            Self::Loopback => write!(f, "loopback"),
        }
    }
}

impl std::str::FromStr for WakeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waker" => Ok(Self::Waker),
            "loopback" => Ok(Self::Loopback),
            other => Err(format!("unknown wake mode '{other}' (expected waker or loopback)")),
        }
    }
}

/// A registered way to wake one reactor.
#[derive(Debug, Clone)]
pub enum ReactorWaker {
    Poll(ReactorHandle),
    Loopback(SocketAddr),
}

impl ReactorWaker {
    /// Builds the waker for `handle` according to `mode`.
    pub fn for_reactor(handle: &ReactorHandle, mode: WakeMode) -> Self {
        match mode {
            WakeMode::Waker => Self::Poll(handle.clone()),
            WakeMode::Loopback => Self::Loopback(handle.local_addr()),
        }
    }

    /// Interrupts the reactor's wait. Failures are logged at trace and ignored.
    pub fn wake(&self) {
        match self {
            Self::Poll(handle) => handle.wake(),
            Self::Loopback(addr) => loopback_wake(*addr),
        }
    }
}

/// Starts a TCP connection to `addr` and drops it without waiting.
///
/// The connect is non-blocking, so a handshake still in progress counts as
/// sent. An unspecified listener address (`0.0.0.0` / `::`) is mapped to the
/// matching loopback address.
pub fn loopback_wake(addr: SocketAddr) {
    let target = connect_target(addr);
    match TcpStream::connect(target) {
        Ok(stream) => drop(stream),
        // The listener may be gone if the reactor is shutting down.
        Err(e) => log::trace!("[Wake] Loopback connect to {} failed: {}", target, e),
    }
}

fn connect_target(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn loopback_wake_makes_listener_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        loopback_wake(addr);

        let deadline = Instant::now() + Duration::from_secs(5);
        let peer = loop {
            match listener.accept() {
                Ok((_stream, peer)) => break peer,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "wake connection never arrived");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn loopback_wake_does_not_wait_for_the_handshake() {
        // Documentation range; nothing answers, so a blocking connect would stall.
        let unreachable: SocketAddr = "192.0.2.1:3483".parse().unwrap();
        let started = Instant::now();
        loopback_wake(unreachable);
        assert!(started.elapsed() < Duration::from_millis(50), "{:?}", started.elapsed());
    }

    #[test]
    fn loopback_wake_to_closed_port_is_silent() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        loopback_wake(addr);
    }

    #[test]
    fn unspecified_address_maps_to_loopback() {
        let addr: SocketAddr = "0.0.0.0:3483".parse().unwrap();
        assert_eq!(connect_target(addr), "127.0.0.1:3483".parse().unwrap());

        let addr: SocketAddr = "[::]:9000".parse().unwrap();
        assert_eq!(connect_target(addr), "[::1]:9000".parse().unwrap());

        let addr: SocketAddr = "192.168.1.4:9000".parse().unwrap();
        assert_eq!(connect_target(addr), addr);
    }

    #[test]
    fn wake_mode_parses_and_serializes() {
        assert_eq!("Loopback".parse::<WakeMode>().unwrap(), WakeMode::Loopback);
        assert!("pipe".parse::<WakeMode>().is_err());
        assert_eq!(serde_json::to_string(&WakeMode::Waker).unwrap(), "\"waker\"");
        assert_eq!(WakeMode::Loopback.to_string(), "loopback");
    }
}
