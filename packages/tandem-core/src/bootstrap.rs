//! Application bootstrap and dependency wiring.
//!
//! The composition root: opens the coordinator, binds both protocol
//! reactors and connects the coordinator to each reactor's wake path.
//! Binding happens in [`bootstrap`] so port conflicts surface before any
//! thread is started; [`Services::spawn`] then runs each reactor on its own
//! thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::ServerError;
use crate::http::HttpFactory;
use crate::net::{Reactor, ReactorHandle, ReactorWaker};
use crate::slim::SlimFactory;

/// Bound but not yet running servers.
pub struct Services {
    coordinator: Arc<Coordinator>,
    http: Reactor<HttpFactory>,
    slim: Reactor<SlimFactory>,
}

/// Wires everything together in dependency order:
///
/// 1. Coordinator (loads persisted playlists and player settings)
/// 2. HTTP reactor (its real port is what devices are told to stream from)
/// 3. Slim reactor
/// 4. Wakers for both reactors, per `config.wake_mode`
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a listener cannot be
/// bound.
pub fn bootstrap(config: &Config) -> Result<Services, ServerError> {
    config.validate().map_err(ServerError::Config)?;

    let coordinator = Arc::new(Coordinator::open(config.data_dir.as_deref()));

    let http = Reactor::bind(
        "http",
        &config.http,
        HttpFactory::new(Arc::clone(&coordinator), config.html_root.clone()),
    )?;
    let http_port = http.local_addr().port();

    let slim = Reactor::bind(
        "slim",
        &config.slim,
        SlimFactory::new(Arc::clone(&coordinator), http_port),
    )?;

    coordinator.register_reactor(ReactorWaker::for_reactor(&http.handle(), config.wake_mode));
    coordinator.register_reactor(ReactorWaker::for_reactor(&slim.handle(), config.wake_mode));

    log::info!(
        "[Bootstrap] HTTP on {}, slim on {} (wake mode: {})",
        http.local_addr(),
        slim.local_addr(),
        config.wake_mode
    );

    Ok(Services {
        coordinator,
        http,
        slim,
    })
}

impl Services {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub fn slim_addr(&self) -> SocketAddr {
        self.slim.local_addr()
    }

    /// Starts both reactor threads (`tandem-http`, `tandem-slim`).
    pub fn spawn(self) -> Result<RunningServers, ServerError> {
        let Self {
            coordinator,
            http,
            slim,
        } = self;
        let http_handle = http.handle();
        let slim_handle = slim.handle();

        let http_thread = http
            .spawn()
            .map_err(|e| ServerError::Thread(format!("http: {e}")))?;
        let slim_thread = match slim.spawn() {
            Ok(thread) => thread,
            Err(e) => {
                http_handle.stop();
                let _ = http_thread.join();
                return Err(ServerError::Thread(format!("slim: {e}")));
            }
        };

        Ok(RunningServers {
            coordinator,
            http: http_handle,
            slim: slim_handle,
            threads: vec![http_thread, slim_thread],
        })
    }
}

/// Both reactors, running.
pub struct RunningServers {
    coordinator: Arc<Coordinator>,
    http: ReactorHandle,
    slim: ReactorHandle,
    threads: Vec<JoinHandle<()>>,
}

impl RunningServers {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub fn slim_addr(&self) -> SocketAddr {
        self.slim.local_addr()
    }

    /// Returns true if either reactor thread has exited.
    pub fn any_finished(&self) -> bool {
        self.threads.iter().any(JoinHandle::is_finished)
    }

    /// Stops both reactors, waits for their threads and writes persisted
    /// state one last time.
    pub fn shutdown(self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.http.stop();
        self.slim.stop();

        for thread in self.threads {
            let name = thread.thread().name().unwrap_or("reactor").to_string();
            if thread.join().is_err() {
                log::error!("[Bootstrap] Thread {} panicked", name);
            }
        }

        if let Err(e) = self.coordinator.persist_now() {
            log::warn!("[Bootstrap] Final persist failed: {}", e);
        }
        log::info!("[Bootstrap] Shutdown complete");
    }
}
