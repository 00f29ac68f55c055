//! On-disk persistence for playlist groups and player settings.
//!
//! Both files are small JSON documents rewritten in full after every
//! mutation (atomic temp file + rename). A store without a directory keeps
//! nothing, which is what tests and `data_dir: null` use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use super::devices::PlayerSettingsMap;
use super::playlist::PlaylistGroup;
use crate::error::CoordinatorError;
use crate::protocol_constants::{PLAYERS_FILE, PLAYLISTS_FILE};
use crate::utils::write_json_atomic;

pub(crate) struct Store {
    dir: Option<PathBuf>,
}

impl Store {
    pub fn new(dir: Option<&Path>) -> Self {
        Self {
            dir: dir.map(Path::to_path_buf),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Loads persisted groups keyed by name. Missing or unreadable files
    /// yield an empty map.
    pub fn load_groups(&self) -> BTreeMap<String, PlaylistGroup> {
        let groups: Vec<PlaylistGroup> = self.load(PLAYLISTS_FILE).unwrap_or_default();
        groups
            .into_iter()
            .map(|mut group| {
                if group.current >= group.tracks.len() {
                    group.current = 0;
                }
                (group.name.clone(), group)
            })
            .collect()
    }

    pub fn load_players(&self) -> PlayerSettingsMap {
        self.load(PLAYERS_FILE).unwrap_or_default()
    }

    pub fn save_groups(&self, groups: &BTreeMap<String, PlaylistGroup>) -> Result<(), CoordinatorError> {
        let list: Vec<&PlaylistGroup> = groups.values().collect();
        self.save(PLAYLISTS_FILE, &list)
    }

    pub fn save_players(&self, players: &PlayerSettingsMap) -> Result<(), CoordinatorError> {
        self.save(PLAYERS_FILE, players)
    }

    fn load<T: DeserializeOwned>(&self, file_name: &str) -> Option<T> {
        let path = self.dir.as_ref()?.join(file_name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("[Coordinator] Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("[Coordinator] Failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }

    fn save<T: serde::Serialize>(&self, file_name: &str, value: &T) -> Result<(), CoordinatorError> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(());
        };
        write_json_atomic(dir, file_name, value)
            .map_err(|e| CoordinatorError::Persistence(format!("{file_name}: {e}")))
    }
}
