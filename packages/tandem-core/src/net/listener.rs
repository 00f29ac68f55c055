//! Listening socket construction.

use std::net::SocketAddr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ServerError;
use crate::protocol_constants::LISTEN_BACKLOG;

/// Creates a non-blocking TCP listener bound to `addr`.
///
/// Sets up socket options for a long-lived server socket:
/// - SO_REUSEADDR so a restart does not wait out TIME_WAIT
/// - an explicit listen backlog
/// - non-blocking mode, required by the reactor
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let bind_err = |source| ServerError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;

    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("Failed to set SO_REUSEADDR on {}: {}", addr, e);
    }

    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port_on_loopback() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn second_bind_on_same_port_fails_with_bind_error() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        match bind_listener(addr) {
            Err(ServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind error, got {other:?}"),
        }
    }
}
