//! Device-change notifications.
//!
//! A notification is a callback waiting for one client's state to change,
//! typically an HTTP long poll holding a deferred output source. Callbacks
//! return [`CallbackControl::Done`] to be removed after firing once, or
//! [`CallbackControl::Continue`] to stay registered.

use std::fmt;
use std::sync::Weak;

use super::devices::DeviceSnapshot;
use super::Coordinator;

/// Identifies one registered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(pub(crate) u64);

/// What a callback wants after it has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackControl {
    /// Keep the registration for the next change.
    Continue,
    /// Remove the registration.
    Done,
}

/// Event delivered to a notification callback.
#[derive(Debug)]
pub enum DeviceEvent<'a> {
    /// The device's state changed; the snapshot was taken after the change.
    Changed(&'a DeviceSnapshot),
    /// The device is no longer registered. The callback is removed afterwards
    /// whatever it returns.
    Removed,
}

pub type NotificationCallback = Box<dyn FnMut(DeviceEvent<'_>) -> CallbackControl + Send>;

pub(crate) struct NotificationRegistration {
    pub id: NotificationId,
    pub client_id: String,
    pub callback: NotificationCallback,
}

impl fmt::Debug for NotificationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRegistration")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Unregisters its notification when dropped.
///
/// Held by the deferred output source the notification will complete, so
/// closing the connection also withdraws the callback.
pub struct NotificationGuard {
    coordinator: Weak<Coordinator>,
    id: NotificationId,
}

impl NotificationGuard {
    pub(crate) fn new(coordinator: Weak<Coordinator>, id: NotificationId) -> Self {
        Self { coordinator, id }
    }

    pub fn id(&self) -> NotificationId {
        self.id
    }
}

impl fmt::Debug for NotificationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationGuard").field("id", &self.id).finish()
    }
}

impl Drop for NotificationGuard {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unregister_notification(self.id);
        }
    }
}
