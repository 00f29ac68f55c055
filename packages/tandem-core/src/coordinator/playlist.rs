//! Playlist groups and track descriptors.
//!
//! A [`PlaylistGroup`] is plain data; the [`Coordinator`](super::Coordinator)
//! owns every group behind its group lock and is the only caller of the
//! mutating methods here.

use serde::{Deserialize, Serialize};

use crate::utils::now_millis;

/// Container format of a track, as far as a device needs to know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Flac,
    Pcm,
    #[default]
    Unknown,
}

impl AudioFormat {
    /// Guesses the format from a file extension.
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit('.').next().unwrap_or_default();
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Self::Mp3,
            "flac" => Self::Flac,
            "wav" | "pcm" | "aif" | "aiff" => Self::Pcm,
            _ => Self::Unknown,
        }
    }

    /// Single-byte format code used in the device `strm` command.
    pub fn strm_code(self) -> u8 {
        match self {
            Self::Mp3 | Self::Unknown => b'm',
            Self::Flac => b'f',
            Self::Pcm => b'p',
        }
    }

    /// MIME type for HTTP responses.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Flac => "audio/flac",
            Self::Pcm => "audio/wav",
            Self::Unknown => "application/octet-stream",
        }
    }
}

/// Descriptor of one playable item.
///
/// `url` is either a local file path or a remote URL; only local files are
/// streamed by the HTTP server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Track {
    pub url: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub format: AudioFormat,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub sample_rate: u32,
}

impl Track {
    /// Creates a track for a local file, guessing the format from the extension.
    pub fn from_path(path: impl Into<String>) -> Self {
        let url = path.into();
        let title = url
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            format: AudioFormat::from_path(&url),
            title,
            url,
            ..Self::default()
        }
    }

    /// Returns true if `url` refers to a remote resource rather than a file.
    pub fn is_remote(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

/// Reference point for [`Coordinator::advance`](super::Coordinator::advance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekOrigin {
    /// Offset counts from the first track.
    FromStart,
    /// Offset counts back from one past the last track.
    FromEnd,
    /// Offset is relative to the current track.
    FromCurrent,
}

/// Result of an advance: the new current index and whether playback ran
/// past the last track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceOutcome {
    pub index: usize,
    pub at_end: bool,
}

/// A named playlist shared by every device following it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistGroup {
    pub name: String,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub current: usize,
    #[serde(default)]
    pub repeat: bool,
    /// Bumped on every mutation. Consumers compare versions to detect change.
    #[serde(default)]
    pub version: u64,
    /// Unix milliseconds of the last mutation.
    #[serde(default)]
    pub updated_at: u64,
}

impl PlaylistGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tracks: Vec::new(),
            current: 0,
            repeat: false,
            version: 0,
            updated_at: 0,
        }
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = now_millis();
    }

    /// Replaces all tracks and rewinds to the first. Returns the new length.
    pub(crate) fn replace(&mut self, tracks: Vec<Track>) -> usize {
        self.tracks = tracks;
        self.current = 0;
        self.touch();
        self.tracks.len()
    }

    /// Inserts `tracks` before `offset`, or appends when `offset` is `None` or
    /// out of range. The current index keeps pointing at the same track.
    /// Returns the new length.
    pub(crate) fn insert(&mut self, tracks: Vec<Track>, offset: Option<usize>) -> usize {
        let added = tracks.len();
        let at = match offset {
            Some(offset) if offset < self.tracks.len() => offset,
            _ => self.tracks.len(),
        };
        if at <= self.current && at < self.tracks.len() {
            self.current += added;
        }
        self.tracks.splice(at..at, tracks);
        self.touch();
        self.tracks.len()
    }

    /// Moves the current index.
    ///
    /// The target is clamped into range; running past the end sets `at_end`
    /// unless the group repeats, in which case playback wraps to the start.
    /// An empty group stays at 0 and is always at the end.
    pub(crate) fn seek(&mut self, offset: i64, origin: SeekOrigin) -> AdvanceOutcome {
        let len = self.tracks.len() as i64;
        let target = match origin {
            SeekOrigin::FromStart => offset,
            SeekOrigin::FromEnd => len.saturating_sub(offset),
            SeekOrigin::FromCurrent => (self.current as i64).saturating_add(offset),
        }
        .max(0);

        let mut at_end = target >= len;
        let mut index = target.min((len - 1).max(0)) as usize;
        if self.repeat && at_end && len > 0 {
            index = 0;
            at_end = false;
        }

        self.current = index;
        self.touch();
        AdvanceOutcome { index, at_end }
    }

    /// The track at the current index, if any.
    pub fn current_track(&self) -> Option<&Track> {
        self.tracks.get(self.current)
    }

    pub(crate) fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
        self.touch();
    }
}
