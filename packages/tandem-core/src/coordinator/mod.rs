//! Cross-thread shared state.
//!
//! The [`Coordinator`] is the single source of truth for playlist groups,
//! registered devices, pending notifications and per-player settings. Both
//! reactor threads share one instance behind an `Arc`.
//!
//! # Locking
//!
//! Four lock domains, each guarding only its own data:
//!
//! | Order | Lock            | Guards                                  |
//! |-------|-----------------|-----------------------------------------|
//! | 1     | `groups`        | playlist groups (+ `playlists.json`)    |
//! | 2     | `devices`       | device registrations                    |
//! | 3     | `notifications` | pending notification callbacks          |
//! | 4     | `settings`      | per-player settings (+ `players.json`)  |
//!
//! An operation that needs several takes them in this order. No lock is ever
//! held across a call into a [`DeviceControl`] or a notification callback:
//! the coordinator collects what it needs, releases, then calls out. That
//! makes callbacks free to call back into the coordinator.

mod devices;
mod notify;
mod playlist;
mod store;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

pub use devices::{DeviceControl, DeviceSnapshot, DeviceStatus, PlayState, PlayerSettings};
pub use notify::{
    CallbackControl, DeviceEvent, NotificationCallback, NotificationGuard, NotificationId,
};
pub use playlist::{AdvanceOutcome, AudioFormat, PlaylistGroup, SeekOrigin, Track};

use devices::{DeviceRegistration, PlayerSettingsMap};
use notify::NotificationRegistration;
use store::Store;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::net::ReactorWaker;
use crate::protocol_constants::DEFAULT_GROUP;

/// Pending callbacks plus the bookkeeping that lets a callback unregister
/// itself (or another) while it is being invoked.
#[derive(Default)]
struct NotificationTable {
    entries: Vec<NotificationRegistration>,
    /// Taken out of `entries` and currently being invoked.
    in_flight: HashSet<NotificationId>,
    /// Unregistered while in flight; dropped instead of re-inserted.
    cancelled: HashSet<NotificationId>,
}

/// Process-wide shared state for both protocol servers.
pub struct Coordinator {
    groups: Mutex<BTreeMap<String, PlaylistGroup>>,
    devices: Mutex<HashMap<String, DeviceRegistration>>,
    notifications: Mutex<NotificationTable>,
    settings: Mutex<PlayerSettingsMap>,
    wakers: RwLock<Vec<ReactorWaker>>,
    next_notification: AtomicU64,
    store: Store,
}

impl Coordinator {
    /// Opens the coordinator, loading persisted state from `data_dir`.
    ///
    /// `None` keeps everything in memory. The default group always exists.
    pub fn open(data_dir: Option<&Path>) -> Self {
        let store = Store::new(data_dir);
        let mut groups = store.load_groups();
        let settings = store.load_players();

        if !groups.contains_key(DEFAULT_GROUP) {
            groups.insert(DEFAULT_GROUP.to_string(), PlaylistGroup::new(DEFAULT_GROUP));
        }

        match store.dir() {
            Some(dir) => log::info!(
                "[Coordinator] Loaded {} group(s) and {} player setting(s) from {}",
                groups.len(),
                settings.len(),
                dir.display()
            ),
            None => log::info!("[Coordinator] Running without persistence"),
        }

        Self {
            groups: Mutex::new(groups),
            devices: Mutex::new(HashMap::new()),
            notifications: Mutex::new(NotificationTable::default()),
            settings: Mutex::new(settings),
            wakers: RwLock::new(Vec::new()),
            next_notification: AtomicU64::new(1),
            store,
        }
    }

    /// In-memory coordinator with only the default group.
    pub fn in_memory() -> Self {
        Self::open(None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reactors
    // ─────────────────────────────────────────────────────────────────────────

    /// Adds a reactor to wake after notifications fire.
    pub fn register_reactor(&self, waker: ReactorWaker) {
        self.wakers.write().push(waker);
    }

    /// Interrupts every registered reactor's readiness wait.
    pub fn wake_reactors(&self) {
        let wakers = self.wakers.read().clone();
        for waker in &wakers {
            waker.wake();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers a device and returns the number of registered devices.
    ///
    /// The device follows its remembered group (if that group still exists)
    /// or the default group, and gets its remembered volume back.
    pub fn add_device(&self, client_id: &str, handle: Weak<dyn DeviceControl>) -> usize {
        let (count, saved, group) = {
            let groups = self.groups.lock();
            let mut devices = self.devices.lock();
            let saved = self.settings.lock().get(client_id).cloned();

            let group = saved
                .as_ref()
                .map(|s| s.group.as_str())
                .filter(|g| groups.contains_key(*g))
                .unwrap_or(DEFAULT_GROUP)
                .to_string();

            let replaced = devices.insert(
                client_id.to_string(),
                DeviceRegistration {
                    handle: handle.clone(),
                    group: group.clone(),
                },
            );
            if replaced.is_some() {
                log::warn!("[Coordinator] Device {} registered twice", client_id);
            }
            (devices.len(), saved, group)
        };

        if let (Some(saved), Some(device)) = (saved, handle.upgrade()) {
            device.set_volume(saved.volume);
        }

        log::info!(
            "[Coordinator] Device {} joined group '{}' ({} registered)",
            client_id,
            group,
            count
        );
        count
    }

    /// Drops a device registration and remembers its settings. Returns the
    /// number of devices still registered.
    ///
    /// Pending notifications for the device are left in place and pruned on
    /// the next notification cycle.
    pub fn remove_device(&self, client_id: &str) -> usize {
        let (removed, count) = {
            let mut devices = self.devices.lock();
            let removed = devices.remove(client_id);
            (removed, devices.len())
        };

        let Some(registration) = removed else {
            return count;
        };

        let volume = registration.handle.upgrade().map(|device| device.status().volume);
        {
            let mut settings = self.settings.lock();
            let entry = settings.entry(client_id.to_string()).or_default();
            if let Some(volume) = volume {
                entry.volume = volume;
            }
            entry.group = registration.group;
            if let Err(e) = self.store.save_players(&settings) {
                log::warn!("[Coordinator] Failed to persist player settings: {}", e);
            }
        }

        log::info!("[Coordinator] Device {} left ({} registered)", client_id, count);
        count
    }

    /// Name of the group a device follows.
    pub fn current_group(&self, client_id: &str) -> Option<String> {
        self.devices.lock().get(client_id).map(|r| r.group.clone())
    }

    /// Makes a device follow another group.
    pub fn follow_group(&self, client_id: &str, group: &str) -> CoordinatorResult<()> {
        let groups = self.groups.lock();
        if !groups.contains_key(group) {
            return Err(CoordinatorError::GroupNotFound(group.to_string()));
        }
        let mut devices = self.devices.lock();
        let registration = devices
            .get_mut(client_id)
            .ok_or_else(|| CoordinatorError::DeviceNotFound(client_id.to_string()))?;
        registration.group = group.to_string();
        log::info!("[Coordinator] Device {} now follows '{}'", client_id, group);
        Ok(())
    }

    /// Live handle to a registered device, if its connection is still open.
    pub fn device(&self, client_id: &str) -> Option<Arc<dyn DeviceControl>> {
        let weak = self.devices.lock().get(client_id)?.handle.clone();
        weak.upgrade()
    }

    /// Latest status reported by a device.
    pub fn device_status(&self, client_id: &str) -> Option<DeviceStatus> {
        self.device(client_id).map(|device| device.status())
    }

    /// Snapshot of one device and its group.
    pub fn device_snapshot(&self, client_id: &str) -> Option<DeviceSnapshot> {
        self.snapshots(Some(client_id)).pop()
    }

    /// Snapshots of every live device, sorted by client id.
    pub fn list_devices(&self) -> Vec<DeviceSnapshot> {
        let mut list = self.snapshots(None);
        list.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        list
    }

    /// Remembered settings for a player, if it has ever disconnected.
    pub fn player_settings(&self, client_id: &str) -> Option<PlayerSettings> {
        self.settings.lock().get(client_id).cloned()
    }

    fn snapshots(&self, only: Option<&str>) -> Vec<DeviceSnapshot> {
        struct Pending {
            client_id: String,
            handle: Weak<dyn DeviceControl>,
            group: String,
            current_index: usize,
            track_count: usize,
            current_track: Option<Track>,
            group_version: u64,
        }

        let pending: Vec<Pending> = {
            let groups = self.groups.lock();
            let devices = self.devices.lock();
            devices
                .iter()
                .filter(|(id, _)| only.map_or(true, |only| only == id.as_str()))
                .map(|(id, reg)| {
                    let group = groups.get(&reg.group);
                    Pending {
                        client_id: id.clone(),
                        handle: reg.handle.clone(),
                        group: reg.group.clone(),
                        current_index: group.map_or(0, |g| g.current),
                        track_count: group.map_or(0, |g| g.tracks.len()),
                        current_track: group.and_then(|g| g.current_track().cloned()),
                        group_version: group.map_or(0, |g| g.version),
                    }
                })
                .collect()
        };

        pending
            .into_iter()
            .filter_map(|p| {
                let device = p.handle.upgrade()?;
                Some(DeviceSnapshot {
                    client_id: p.client_id,
                    group: p.group,
                    status: device.status(),
                    current_index: p.current_index,
                    track_count: p.track_count,
                    current_track: p.current_track,
                    group_version: p.group_version,
                })
            })
            .collect()
    }

    /// Live devices following `group`.
    fn followers(&self, group: &str) -> Vec<Arc<dyn DeviceControl>> {
        self.devices
            .lock()
            .values()
            .filter(|reg| reg.group == group)
            .filter_map(|reg| reg.handle.upgrade())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Creates an empty group. Returns false if it already existed.
    pub fn create_group(&self, name: &str) -> bool {
        let mut groups = self.groups.lock();
        if groups.contains_key(name) {
            return false;
        }
        groups.insert(name.to_string(), PlaylistGroup::new(name));
        self.persist_groups(&groups);
        log::info!("[Coordinator] Created group '{}'", name);
        true
    }

    /// Names of all groups, sorted.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.lock().keys().cloned().collect()
    }

    /// Copy of a group's full state.
    pub fn playlist(&self, group: &str) -> CoordinatorResult<PlaylistGroup> {
        self.groups
            .lock()
            .get(group)
            .cloned()
            .ok_or_else(|| CoordinatorError::GroupNotFound(group.to_string()))
    }

    /// The track at a group's current index.
    pub fn current_track(&self, group: &str) -> Option<Track> {
        self.groups.lock().get(group)?.current_track().cloned()
    }

    /// Replaces a group's tracks and rewinds it. Returns the new length.
    pub fn replace_playlist(&self, group: &str, tracks: Vec<Track>) -> CoordinatorResult<usize> {
        self.mutate_group(group, |g| g.replace(tracks))
    }

    /// Inserts tracks before `offset` (or appends). Returns the new length.
    pub fn append_to_playlist(
        &self,
        group: &str,
        tracks: Vec<Track>,
        offset: Option<usize>,
    ) -> CoordinatorResult<usize> {
        self.mutate_group(group, |g| g.insert(tracks, offset))
    }

    /// Turns repeat on or off for a group.
    pub fn set_repeat(&self, group: &str, repeat: bool) -> CoordinatorResult<()> {
        self.mutate_group(group, |g| g.set_repeat(repeat))
    }

    /// Moves a group's current index and tells its devices.
    ///
    /// Every live device following the group is stopped first if
    /// `stop_current` is set, then told to play unless the group ran past
    /// its last track. Devices whose connection has closed are skipped.
    pub fn advance(
        &self,
        group: &str,
        offset: i64,
        origin: SeekOrigin,
        stop_current: bool,
    ) -> CoordinatorResult<AdvanceOutcome> {
        let outcome = self.mutate_group(group, |g| g.seek(offset, origin))?;
        let followers = self.followers(group);

        for device in &followers {
            if stop_current {
                device.stop();
            }
            if !outcome.at_end {
                device.play();
            }
        }

        log::info!(
            "[Coordinator] Group '{}' advanced to {}{} ({} device(s))",
            group,
            outcome.index,
            if outcome.at_end { " (end)" } else { "" },
            followers.len()
        );
        Ok(outcome)
    }

    /// Stops every device following a group. Returns how many were told.
    pub fn stop_group(&self, group: &str) -> CoordinatorResult<usize> {
        if !self.groups.lock().contains_key(group) {
            return Err(CoordinatorError::GroupNotFound(group.to_string()));
        }
        let followers = self.followers(group);
        for device in &followers {
            device.stop();
        }
        Ok(followers.len())
    }

    /// Applies `f` to a group and persists the result while the group lock
    /// is still held.
    fn mutate_group<T>(
        &self,
        group: &str,
        f: impl FnOnce(&mut PlaylistGroup) -> T,
    ) -> CoordinatorResult<T> {
        let mut groups = self.groups.lock();
        let entry = groups
            .get_mut(group)
            .ok_or_else(|| CoordinatorError::GroupNotFound(group.to_string()))?;
        let result = f(entry);
        self.persist_groups(&groups);
        Ok(result)
    }

    fn persist_groups(&self, groups: &BTreeMap<String, PlaylistGroup>) {
        if let Err(e) = self.store.save_groups(groups) {
            log::warn!("[Coordinator] Failed to persist playlists: {}", e);
        }
    }

    /// Writes all persisted state now.
    pub fn persist_now(&self) -> CoordinatorResult<()> {
        {
            let groups = self.groups.lock();
            self.store.save_groups(&groups)?;
        }
        let settings = self.settings.lock();
        self.store.save_players(&settings)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers a callback for changes to `client_id`.
    pub fn register_notification(
        &self,
        client_id: &str,
        callback: NotificationCallback,
    ) -> NotificationId {
        let id = NotificationId(self.next_notification.fetch_add(1, Ordering::Relaxed));
        self.notifications.lock().entries.push(NotificationRegistration {
            id,
            client_id: client_id.to_string(),
            callback,
        });
        id
    }

    /// Like [`register_notification`](Self::register_notification), but
    /// returns a guard that unregisters on drop.
    pub fn watch(
        self: &Arc<Self>,
        client_id: &str,
        callback: NotificationCallback,
    ) -> NotificationGuard {
        let id = self.register_notification(client_id, callback);
        NotificationGuard::new(Arc::downgrade(self), id)
    }

    /// Removes a callback. Safe to call from inside any callback, including
    /// the one being removed. Returns false if it was not registered.
    pub fn unregister_notification(&self, id: NotificationId) -> bool {
        let mut table = self.notifications.lock();
        if let Some(pos) = table.entries.iter().position(|r| r.id == id) {
            table.entries.remove(pos);
            return true;
        }
        if table.in_flight.contains(&id) {
            return table.cancelled.insert(id);
        }
        false
    }

    /// Number of registered callbacks (including ones being invoked).
    pub fn pending_notifications(&self) -> usize {
        let table = self.notifications.lock();
        table.entries.len() + table.in_flight.len() - table.cancelled.len()
    }

    /// Tells watchers of `client_id` that its state changed.
    ///
    /// Matching callbacks receive a fresh snapshot. Callbacks whose device is
    /// no longer registered receive [`DeviceEvent::Removed`] and are dropped.
    /// If anything fired, every registered reactor is woken so deferred
    /// output completed by a callback is sent without waiting for the poll
    /// timeout. Returns the number of callbacks invoked.
    pub fn notify_device_changed(&self, client_id: &str) -> usize {
        let snapshot = self.device_snapshot(client_id);

        // The device table stays locked while the notification table is
        // partitioned, so a device added in between cannot look departed.
        let (matching, orphans) = {
            let devices = self.devices.lock();
            let mut table = self.notifications.lock();
            let mut matching = Vec::new();
            let mut orphans = Vec::new();
            let mut kept = Vec::with_capacity(table.entries.len());

            for reg in table.entries.drain(..) {
                if !devices.contains_key(&reg.client_id) {
                    orphans.push(reg);
                } else if reg.client_id == client_id && snapshot.is_some() {
                    matching.push(reg);
                } else {
                    kept.push(reg);
                }
            }
            table.entries = kept;
            for reg in matching.iter().chain(orphans.iter()) {
                table.in_flight.insert(reg.id);
            }
            (matching, orphans)
        };

        let fired = matching.len() + orphans.len();
        if fired == 0 {
            return 0;
        }

        let mut keep = Vec::new();
        if let Some(snapshot) = snapshot.as_ref() {
            for mut reg in matching {
                if (reg.callback)(DeviceEvent::Changed(snapshot)) == CallbackControl::Continue {
                    keep.push(reg);
                } else {
                    self.finish_in_flight(reg.id);
                }
            }
        }
        for mut reg in orphans {
            log::debug!(
                "[Coordinator] Pruning notification {:?} for departed device {}",
                reg.id,
                reg.client_id
            );
            let _ = (reg.callback)(DeviceEvent::Removed);
            self.finish_in_flight(reg.id);
        }

        {
            let mut table = self.notifications.lock();
            for reg in keep {
                table.in_flight.remove(&reg.id);
                if !table.cancelled.remove(&reg.id) {
                    table.entries.push(reg);
                }
            }
        }

        self.wake_reactors();
        fired
    }

    fn finish_in_flight(&self, id: NotificationId) {
        let mut table = self.notifications.lock();
        table.in_flight.remove(&id);
        table.cancelled.remove(&id);
    }
}
