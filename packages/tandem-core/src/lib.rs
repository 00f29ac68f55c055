//! Tandem Core - shared library for the Tandem audio server.
//!
//! Tandem keeps a set of network audio players in step: players that follow
//! the same playlist group play the same track, and advance together when
//! any of them finishes. Two protocol servers run side by side, each on its
//! own thread:
//!
//! - a binary device-control server that players connect to, and
//! - an HTTP server for audio streams, static pages, status and control.
//!
//! # Architecture
//!
//! - [`net`]: Single-threaded reactor, connection lifecycle, output sources
//!   and the cross-thread wake path
//! - [`coordinator`]: Shared playlist groups, device registry, notifications
//!   and persisted player settings
//! - [`slim`]: Device-control protocol handler
//! - [`http`]: HTTP handler
//! - [`bootstrap`]: Composition root wiring the above together
//! - [`config`]: Configuration types
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! - [`Handler`](net::Handler) / [`HandlerFactory`](net::HandlerFactory):
//!   protocol logic plugged into a reactor
//! - [`DeviceControl`](coordinator::DeviceControl): what the coordinator may
//!   ask of a connected player

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod net;
pub mod protocol_constants;
pub mod slim;
pub mod utils;

// Re-export commonly used types at the crate root
pub use config::{Config, ReactorConfig};
pub use error::{CoordinatorError, CoordinatorResult, ErrorCode, ServerError, TandemError, TandemResult};
pub use utils::now_millis;

// Re-export coordinator types
pub use coordinator::{
    AdvanceOutcome, AudioFormat, CallbackControl, Coordinator, DeviceControl, DeviceEvent,
    DeviceSnapshot, DeviceStatus, NotificationGuard, NotificationId, PlayState, PlaylistGroup,
    SeekOrigin, Track,
};

// Re-export reactor types
pub use net::{
    ConnectionContext, Handler, HandlerFactory, OutputQueue, OutputSource, Reactor, ReactorHandle,
    WakeMode,
};

// Re-export bootstrap types
pub use bootstrap::{bootstrap, RunningServers, Services};
