//! Non-blocking connection multiplexing.
//!
//! - [`Reactor`]: one listening socket, many connections, one thread.
//! - [`Handler`] / [`HandlerFactory`]: per-connection protocol logic.
//! - [`OutputSource`] / [`OutputQueue`]: buffered, possibly deferred output.
//! - [`ReactorWaker`]: interrupts a reactor blocked in its readiness wait.

mod connection;
mod handler;
mod listener;
mod output;
mod reactor;
mod wake;

pub use connection::CloseReason;
pub use handler::{ConnectionContext, Handler, HandlerFactory, OutputQueue};
pub use output::{
    DeferredCompleter, DeferredSource, FileSource, MemorySource, OutputSource, ReadOutcome,
};
pub use reactor::{Reactor, ReactorHandle, ReactorStats};
pub use wake::{loopback_wake, ReactorWaker, WakeMode};
