//! General utilities shared across the application.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

/// Serializes `value` as pretty JSON and writes it to `dir/file_name`.
///
/// Uses atomic write (temp file + rename) to prevent corruption on crash.
/// Creates the directory if it doesn't exist.
pub fn write_json_atomic<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    let temp_path = dir.join(format!("{file_name}.tmp"));
    let contents = serde_json::to_string_pretty(value)?;

    std::fs::write(&temp_path, contents)?;
    std::fs::rename(&temp_path, &path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn write_json_atomic_creates_directory_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        write_json_atomic(&nested, "value.json", &vec![1, 2, 3]).unwrap();

        let contents = std::fs::read_to_string(nested.join("value.json")).unwrap();
        let parsed: Vec<u32> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, vec![1, 2, 3]);
        assert!(!nested.join("value.json.tmp").exists());
    }
}
