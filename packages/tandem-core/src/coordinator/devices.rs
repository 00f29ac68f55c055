//! Device registry types.
//!
//! Devices are owned by their protocol connection. The coordinator keeps a
//! [`Weak`] reference per registration, so a device whose connection has
//! closed simply fails to upgrade and is skipped.

use std::collections::BTreeMap;
use std::sync::Weak;

use serde::{Deserialize, Serialize};

use super::playlist::Track;
use crate::protocol_constants::{DEFAULT_GROUP, DEFAULT_VOLUME};

/// Playback state reported by a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Transient status of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Volume, 0-100.
    pub volume: u8,
    /// Playback position within the current track.
    pub elapsed_ms: u64,
    pub play_state: PlayState,
    /// Decoder buffer fill level as reported by the device (bytes).
    pub buffer_fullness: u32,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            elapsed_ms: 0,
            play_state: PlayState::Stopped,
            buffer_fullness: 0,
        }
    }
}

/// Commands the coordinator can issue to a device.
///
/// Implementations are called from either reactor thread and must not block;
/// a slim device queues the command and wakes its own reactor.
pub trait DeviceControl: Send + Sync {
    /// Stable client id (lowercase MAC for slim devices).
    fn client_id(&self) -> &str;

    /// Start playing the current track of the followed group.
    fn play(&self);

    /// Stop playback and flush buffers.
    fn stop(&self);

    /// Pause (`true`) or resume (`false`) playback.
    fn pause(&self, paused: bool);

    /// Set the output volume (0-100).
    fn set_volume(&self, volume: u8);

    /// Latest reported status.
    fn status(&self) -> DeviceStatus;
}

/// One registered device.
pub(crate) struct DeviceRegistration {
    pub handle: Weak<dyn DeviceControl>,
    pub group: String,
}

/// Settings remembered for a player between connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerSettings {
    pub volume: u8,
    pub group: String,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            group: DEFAULT_GROUP.to_string(),
        }
    }
}

/// Persisted settings keyed by client id.
pub(crate) type PlayerSettingsMap = BTreeMap<String, PlayerSettings>;

/// Consistent view of a device and the group it follows, taken under the
/// coordinator's locks and safe to hand to callbacks and serializers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub client_id: String,
    pub group: String,
    pub status: DeviceStatus,
    pub current_index: usize,
    pub track_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_track: Option<Track>,
    /// Version of the followed group when the snapshot was taken.
    pub group_version: u64,
}
