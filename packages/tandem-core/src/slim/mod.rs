//! Device-control protocol server.
//!
//! Each slim connection owns one [`SlimDevice`]. The device is registered
//! with the [`Coordinator`] after `HELO` and removed when the connection
//! closes. Playback commands from the coordinator travel through the
//! device's outbox and are framed on the connection's next tick.

pub mod codec;
mod device;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

pub use codec::{ClientMessage, FrameDecoder, Helo, Stat, StatEvent, StreamCommand};
pub use device::{DeviceCommand, SlimDevice};

use crate::coordinator::{Coordinator, DeviceControl, SeekOrigin};
use crate::net::{ConnectionContext, Handler, HandlerFactory, OutputQueue, ReactorHandle};

/// Creates a [`SlimHandler`] per accepted device connection.
pub struct SlimFactory {
    coordinator: Arc<Coordinator>,
    http_port: u16,
}

impl SlimFactory {
    /// `http_port` is where devices are told to fetch audio from.
    pub fn new(coordinator: Arc<Coordinator>, http_port: u16) -> Self {
        Self {
            coordinator,
            http_port,
        }
    }
}

impl HandlerFactory for SlimFactory {
    type Handler = SlimHandler;

    fn new_handler(&mut self, ctx: &ConnectionContext) -> SlimHandler {
        log::debug!("[Slim] Connection {} from {}", ctx.id, ctx.peer);
        SlimHandler {
            coordinator: Arc::clone(&self.coordinator),
            reactor: ctx.reactor.clone(),
            peer: ctx.peer,
            http_port: self.http_port,
            decoder: FrameDecoder::new(),
            device: None,
        }
    }
}

/// Protocol state for one device connection.
pub struct SlimHandler {
    coordinator: Arc<Coordinator>,
    reactor: ReactorHandle,
    peer: SocketAddr,
    http_port: u16,
    decoder: FrameDecoder,
    device: Option<Arc<SlimDevice>>,
}

impl SlimHandler {
    fn on_helo(&mut self, helo: Helo, out: &mut OutputQueue) {
        let client_id = helo.client_id();
        if let Some(device) = &self.device {
            log::debug!("[Slim] Repeated HELO from {}", device.client_id());
            return;
        }

        log::info!(
            "[Slim] Device {} (type {}, rev {}) connected from {}",
            client_id,
            helo.device_id,
            helo.revision,
            self.peer
        );

        let device = Arc::new(SlimDevice::new(client_id.clone(), self.reactor.clone()));
        let weak: Weak<dyn DeviceControl> = Arc::downgrade(&device) as Weak<dyn DeviceControl>;
        self.device = Some(device);
        self.coordinator.add_device(&client_id, weak);

        out.enqueue(codec::outputs_frame(true, true));
        out.enqueue(StreamCommand::stop().encode());
    }

    fn on_stat(&mut self, stat: Stat) {
        let Some(device) = self.device.clone() else {
            log::debug!("[Slim] STAT before HELO from {}", self.peer);
            return;
        };
        let client_id = device.client_id();
        device.apply_stat(&stat);

        let stop_current = match stat.event {
            StatEvent::DecoderReady => Some(false),
            StatEvent::Underrun => Some(true),
            _ => None,
        };
        if let Some(stop_current) = stop_current {
            if let Some(group) = self.coordinator.current_group(client_id) {
                if let Err(e) = self
                    .coordinator
                    .advance(&group, 1, SeekOrigin::FromCurrent, stop_current)
                {
                    log::warn!("[Slim] Advance for {} failed: {}", client_id, e);
                }
            }
        }

        self.coordinator.notify_device_changed(client_id);
    }

    /// Turns queued device commands into frames.
    fn flush_commands(&self, out: &mut OutputQueue) {
        let Some(device) = &self.device else {
            return;
        };
        for command in device.drain_commands() {
            match command {
                DeviceCommand::Play => {
                    let track = self
                        .coordinator
                        .current_group(device.client_id())
                        .and_then(|group| self.coordinator.current_track(&group));
                    match track {
                        Some(track) if track.is_remote() => {
                            log::warn!("[Slim] Cannot stream remote track {}", track.url);
                        }
                        Some(track) => {
                            log::debug!("[Slim] {} starting {}", device.client_id(), track.url);
                            out.enqueue(
                                StreamCommand::start(&track, self.http_port, device.client_id())
                                    .encode(),
                            );
                        }
                        None => log::debug!("[Slim] Nothing to play for {}", device.client_id()),
                    }
                }
                DeviceCommand::Stop => out.enqueue(StreamCommand::stop().encode()),
                DeviceCommand::Pause(true) => out.enqueue(StreamCommand::pause().encode()),
                DeviceCommand::Pause(false) => out.enqueue(StreamCommand::unpause().encode()),
                DeviceCommand::Volume(volume) => out.enqueue(codec::volume_frame(volume)),
            }
        }
    }
}

impl Handler for SlimHandler {
    fn process_inbound(&mut self, bytes: &[u8], out: &mut OutputQueue) -> bool {
        for frame in self.decoder.decode(bytes) {
            match ClientMessage::parse(frame) {
                Ok(ClientMessage::Helo(helo)) => self.on_helo(helo, out),
                Ok(ClientMessage::Stat(stat)) => self.on_stat(stat),
                Ok(ClientMessage::Bye) => {
                    log::debug!("[Slim] BYE from {}", self.peer);
                    return false;
                }
                Ok(ClientMessage::Resp(headers)) => {
                    log::trace!("[Slim] RESP ({} bytes) from {}", headers.len(), self.peer);
                }
                Ok(ClientMessage::Unknown { opcode, len }) => {
                    log::debug!(
                        "[Slim] Ignoring {} ({} bytes) from {}",
                        String::from_utf8_lossy(&opcode),
                        len,
                        self.peer
                    );
                }
                Err(e) => log::warn!("[Slim] Bad frame from {}: {}", self.peer, e),
            }
        }

        self.flush_commands(out);
        true
    }

    fn on_tick(&mut self, out: &mut OutputQueue) {
        self.flush_commands(out);
    }

    fn on_close(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        let client_id = device.client_id().to_string();

        // A reconnecting device may already have replaced this registration.
        let registered = self
            .coordinator
            .device(&client_id)
            .is_some_and(|current| Arc::as_ptr(&current) as *const () == Arc::as_ptr(&device) as *const ());
        if registered {
            self.coordinator.remove_device(&client_id);
        }
        drop(device);

        self.coordinator.notify_device_changed(&client_id);
        log::info!("[Slim] Device {} disconnected", client_id);
    }
}
