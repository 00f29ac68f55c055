//! Coordinator-facing handle for one connected slim device.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::codec::{Stat, StatEvent};
use crate::coordinator::{DeviceControl, DeviceStatus, PlayState};
use crate::net::ReactorHandle;

/// Command queued for the connection that owns the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Play,
    Stop,
    Pause(bool),
    Volume(u8),
}

/// Shared between the slim connection (strong) and the coordinator (weak).
///
/// Commands may arrive from either reactor thread. They are queued here and
/// the slim reactor is woken so the owning handler turns them into frames on
/// its next tick.
pub struct SlimDevice {
    client_id: String,
    status: Mutex<DeviceStatus>,
    outbox: Mutex<VecDeque<DeviceCommand>>,
    reactor: ReactorHandle,
}

impl SlimDevice {
    pub fn new(client_id: impl Into<String>, reactor: ReactorHandle) -> Self {
        Self {
            client_id: client_id.into(),
            status: Mutex::new(DeviceStatus::default()),
            outbox: Mutex::new(VecDeque::new()),
            reactor,
        }
    }

    /// Takes every queued command, oldest first.
    pub fn drain_commands(&self) -> Vec<DeviceCommand> {
        self.outbox.lock().drain(..).collect()
    }

    /// Folds a status report into the device state.
    pub fn apply_stat(&self, stat: &Stat) {
        let mut status = self.status.lock();
        status.elapsed_ms = stat.elapsed_ms();
        status.buffer_fullness = stat.buffer_fullness;
        match stat.event {
            StatEvent::Started | StatEvent::Resumed => status.play_state = PlayState::Playing,
            StatEvent::Paused => status.play_state = PlayState::Paused,
            StatEvent::Flushed => status.play_state = PlayState::Stopped,
            _ => {}
        }
    }

    fn push(&self, command: DeviceCommand) {
        self.outbox.lock().push_back(command);
        self.reactor.wake();
    }
}

impl DeviceControl for SlimDevice {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn play(&self) {
        self.push(DeviceCommand::Play);
    }

    fn stop(&self) {
        self.status.lock().play_state = PlayState::Stopped;
        self.push(DeviceCommand::Stop);
    }

    fn pause(&self, paused: bool) {
        self.push(DeviceCommand::Pause(paused));
    }

    fn set_volume(&self, volume: u8) {
        let volume = volume.min(100);
        self.status.lock().volume = volume;
        self.push(DeviceCommand::Volume(volume));
    }

    fn status(&self) -> DeviceStatus {
        *self.status.lock()
    }
}
