//! Buffered output sources drained by a [`Connection`](super::connection::Connection).
//!
//! A handler never writes to its socket directly. It enqueues an
//! [`OutputSource`] and the reactor drains it in bounded chunks as the socket
//! becomes writable. Three variants exist:
//!
//! - [`OutputSource::Memory`]: bytes already in memory.
//! - [`OutputSource::File`]: a file (or a byte range of one) read lazily.
//! - [`OutputSource::Deferred`]: bytes that do not exist yet. The source stays
//!   parked until its [`DeferredCompleter`] is consumed, typically from a
//!   coordinator notification callback running on another thread.
//!
//! A deferred source that is not ready reports [`ReadOutcome::NotReady`], which
//! is distinct from [`ReadOutcome::Eof`]: the reactor keeps the connection open
//! and moves on.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::coordinator::NotificationGuard;

/// Result of one [`OutputSource::read_into`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied into the destination (always > 0).
    Data(usize),
    /// The source has no bytes yet. Not an error and not end of data.
    NotReady,
    /// All bytes have been produced.
    Eof,
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory bytes with a read cursor.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    pos: usize,
}

impl MemorySource {
    fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    fn read_into(&mut self, dst: &mut [u8]) -> ReadOutcome {
        let remaining = &self.data[self.pos..];
        if remaining.is_empty() {
            return ReadOutcome::Eof;
        }
        let n = remaining.len().min(dst.len());
        dst[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        ReadOutcome::Data(n)
    }

    fn seek(&mut self, pos: u64) -> u64 {
        self.pos = usize::try_from(pos)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        self.pos as u64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File
// ─────────────────────────────────────────────────────────────────────────────

/// A file, or a byte range of one, read on demand.
///
/// Positions are relative to the start of the range. A file that fails to
/// open behaves as an empty, ready source.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    /// Absolute offset of the range start within the file.
    start: u64,
    /// Length of the range, fixed at construction.
    len: u64,
    pos: u64,
    /// Set when the file turned out shorter than `len`.
    truncated: bool,
}

impl FileSource {
    fn open(path: &Path, start: u64, len: Option<u64>) -> Self {
        let opened = File::open(path).and_then(|mut file| {
            let file_len = file.metadata()?.len();
            let start = start.min(file_len);
            let avail = file_len - start;
            let len = len.map_or(avail, |l| l.min(avail));
            file.seek(SeekFrom::Start(start))?;
            Ok((file, start, len))
        });

        match opened {
            Ok((file, start, len)) => Self {
                path: path.to_path_buf(),
                file: Some(file),
                start,
                len,
                pos: 0,
                truncated: false,
            },
            Err(e) => {
                log::warn!("[Output] Failed to open {}: {}", path.display(), e);
                Self {
                    path: path.to_path_buf(),
                    file: None,
                    start: 0,
                    len: 0,
                    pos: 0,
                    truncated: false,
                }
            }
        }
    }

    /// Returns true if the file was opened successfully.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Path the source was created from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute offset of the first byte served.
    pub fn range_start(&self) -> u64 {
        self.start
    }

    fn read_into(&mut self, dst: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.truncated || self.pos >= self.len {
            return Ok(ReadOutcome::Eof);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(ReadOutcome::Eof);
        };

        let want = (self.len - self.pos).min(dst.len() as u64) as usize;
        let n = loop {
            match file.read(&mut dst[..want]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            log::warn!(
                "[Output] {} is shorter than expected ({} of {} bytes)",
                self.path.display(),
                self.pos,
                self.len
            );
            self.truncated = true;
            return Ok(ReadOutcome::Eof);
        }

        self.pos += n as u64;
        Ok(ReadOutcome::Data(n))
    }

    fn seek(&mut self, pos: u64) -> u64 {
        let pos = pos.min(self.len);
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.seek(SeekFrom::Start(self.start + pos)) {
                log::warn!("[Output] Seek failed on {}: {}", self.path.display(), e);
                return self.pos;
            }
        }
        self.pos = pos;
        self.truncated = false;
        pos
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deferred
// ─────────────────────────────────────────────────────────────────────────────

/// Output whose bytes are supplied later, exactly once, by a [`DeferredCompleter`].
///
/// Once completed it behaves like a memory source. The optional
/// [`NotificationGuard`] ties the coordinator registration that will complete
/// it to the source's lifetime, so a connection closed by the peer also
/// unregisters its pending callback.
#[derive(Debug)]
pub struct DeferredSource {
    cell: Arc<OnceLock<Bytes>>,
    pos: usize,
    guard: Option<NotificationGuard>,
}

impl DeferredSource {
    fn read_into(&mut self, dst: &mut [u8]) -> ReadOutcome {
        let Some(data) = self.cell.get() else {
            return ReadOutcome::NotReady;
        };
        let remaining = &data[self.pos..];
        if remaining.is_empty() {
            return ReadOutcome::Eof;
        }
        let n = remaining.len().min(dst.len());
        dst[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        ReadOutcome::Data(n)
    }

    /// Attaches the notification registration that will complete this source.
    pub fn set_guard(&mut self, guard: NotificationGuard) {
        self.guard = Some(guard);
    }
}

/// Write side of a deferred source.
///
/// Not `Clone`: completing consumes it, so the ready transition happens at
/// most once.
#[derive(Debug)]
pub struct DeferredCompleter {
    cell: Arc<OnceLock<Bytes>>,
}

impl DeferredCompleter {
    /// Supplies the bytes. The source becomes ready and its size is fixed.
    pub fn complete(self, data: impl Into<Bytes>) {
        // The only other owner is the source, which never writes the cell.
        let _ = self.cell.set(data.into());
    }

    /// Returns true if the source has been dropped (its connection closed),
    /// so completing it would be wasted work.
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.cell) == 1
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OutputSource
// ─────────────────────────────────────────────────────────────────────────────

/// A pollable, seekable source of response bytes.
#[derive(Debug)]
pub enum OutputSource {
    Memory(MemorySource),
    File(FileSource),
    Deferred(DeferredSource),
}

impl OutputSource {
    /// Creates a ready source over in-memory bytes.
    pub fn memory(data: impl Into<Bytes>) -> Self {
        Self::Memory(MemorySource::new(data.into()))
    }

    /// Creates a ready source over a whole file.
    ///
    /// Open failures are logged and yield an empty source.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(FileSource::open(path.as_ref(), 0, None))
    }

    /// Creates a ready source over `len` bytes of a file starting at `start`
    /// (`None` = to end of file). The range is clamped to the file size.
    pub fn file_range(path: impl AsRef<Path>, start: u64, len: Option<u64>) -> Self {
        Self::File(FileSource::open(path.as_ref(), start, len))
    }

    /// Creates a pending source and the completer that makes it ready.
    pub fn deferred() -> (Self, DeferredCompleter) {
        let cell = Arc::new(OnceLock::new());
        let source = Self::Deferred(DeferredSource {
            cell: Arc::clone(&cell),
            pos: 0,
            guard: None,
        });
        (source, DeferredCompleter { cell })
    }

    /// Attaches a notification guard to a deferred source.
    ///
    /// Ready sources have nothing to wait for, so the guard is dropped
    /// immediately (unregistering its notification).
    pub fn with_guard(mut self, guard: NotificationGuard) -> Self {
        if let Self::Deferred(deferred) = &mut self {
            deferred.set_guard(guard);
        }
        self
    }

    /// Returns false only for a deferred source that has not been completed.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Memory(_) | Self::File(_) => true,
            Self::Deferred(d) => d.cell.get().is_some(),
        }
    }

    /// Total size in bytes, or `None` while a deferred source is pending.
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::Memory(m) => Some(m.data.len() as u64),
            Self::File(f) => Some(f.len),
            Self::Deferred(d) => d.cell.get().map(|b| b.len() as u64),
        }
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        match self {
            Self::Memory(m) => m.pos as u64,
            Self::File(f) => f.pos,
            Self::Deferred(d) => d.pos as u64,
        }
    }

    /// Bytes left to read, or `None` while a deferred source is pending.
    ///
    /// A file that ended early has nothing left even though its size is
    /// unchanged.
    pub fn remaining_bytes(&self) -> Option<u64> {
        if let Self::File(f) = self {
            if f.truncated {
                return Some(0);
            }
        }
        self.size().map(|size| size.saturating_sub(self.position()))
    }

    /// Returns true once every byte has been read.
    pub fn is_eof(&self) -> bool {
        self.remaining_bytes() == Some(0)
    }

    /// Copies up to `dst.len()` bytes into `dst` and advances the position.
    ///
    /// Never blocks. Only file reads can fail.
    pub fn read_into(&mut self, dst: &mut [u8]) -> io::Result<ReadOutcome> {
        debug_assert!(!dst.is_empty(), "read_into called with an empty buffer");
        match self {
            Self::Memory(m) => Ok(m.read_into(dst)),
            Self::File(f) => f.read_into(dst),
            Self::Deferred(d) => Ok(d.read_into(dst)),
        }
    }

    /// Moves the read position to `pos`, clamped to the size.
    ///
    /// A pending deferred source cannot seek and stays at 0.
    /// Returns the new position.
    pub fn seek(&mut self, pos: u64) -> u64 {
        match self {
            Self::Memory(m) => m.seek(pos),
            Self::File(f) => f.seek(pos),
            Self::Deferred(d) => match d.cell.get() {
                Some(data) => {
                    d.pos = usize::try_from(pos).unwrap_or(usize::MAX).min(data.len());
                    d.pos as u64
                }
                None => 0,
            },
        }
    }

    /// Releases underlying resources early. Afterwards the source reports EOF.
    pub fn close(&mut self) {
        match self {
            Self::Memory(m) => m.pos = m.data.len(),
            Self::File(f) => {
                f.file = None;
                f.pos = f.len;
            }
            Self::Deferred(d) => {
                d.guard = None;
                if let Some(data) = d.cell.get() {
                    d.pos = data.len();
                }
            }
        }
    }
}

impl From<Bytes> for OutputSource {
    fn from(data: Bytes) -> Self {
        Self::memory(data)
    }
}

impl From<String> for OutputSource {
    fn from(data: String) -> Self {
        Self::memory(data)
    }
}

impl From<&'static str> for OutputSource {
    fn from(data: &'static str) -> Self {
        Self::memory(data)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn drain(source: &mut OutputSource, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            match source.read_into(&mut buf).unwrap() {
                ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::Eof => return out,
                ReadOutcome::NotReady => panic!("unexpected NotReady"),
            }
        }
    }

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Memory
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn memory_reads_in_chunks_then_eof() {
        let mut source = OutputSource::memory("hello world");
        assert!(source.is_ready());
        assert_eq!(source.size(), Some(11));

        assert_eq!(drain(&mut source, 4), b"hello world");
        assert!(source.is_eof());
        assert_eq!(source.remaining_bytes(), Some(0));
    }

    #[test]
    fn memory_seek_clamps_to_size() {
        let mut source = OutputSource::memory("abcdef");
        assert_eq!(source.seek(4), 4);
        assert_eq!(drain(&mut source, 16), b"ef");
        assert_eq!(source.seek(100), 6);
        assert!(source.is_eof());
    }

    #[test]
    fn empty_memory_is_immediately_eof() {
        let mut source = OutputSource::memory(Bytes::new());
        let mut buf = [0u8; 8];
        assert_eq!(source.read_into(&mut buf).unwrap(), ReadOutcome::Eof);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // File
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn file_source_reads_whole_file() {
        let file = temp_file(b"0123456789");
        let mut source = OutputSource::file(file.path());
        assert_eq!(source.size(), Some(10));
        assert_eq!(drain(&mut source, 3), b"0123456789");
    }

    #[test]
    fn file_range_serves_only_the_range() {
        let file = temp_file(b"0123456789");
        let mut source = OutputSource::file_range(file.path(), 3, Some(4));
        assert_eq!(source.size(), Some(4));
        assert_eq!(drain(&mut source, 64), b"3456");

        let mut open_ended = OutputSource::file_range(file.path(), 7, None);
        assert_eq!(drain(&mut open_ended, 64), b"789");

        let mut past_end = OutputSource::file_range(file.path(), 50, None);
        assert_eq!(past_end.size(), Some(0));
        assert_eq!(drain(&mut past_end, 64), b"");
    }

    #[test]
    fn file_seek_repositions_the_reader() {
        let file = temp_file(b"0123456789");
        let mut source = OutputSource::file(file.path());
        let mut buf = [0u8; 2];
        source.read_into(&mut buf).unwrap();
        assert_eq!(source.seek(8), 8);
        assert_eq!(drain(&mut source, 64), b"89");
    }

    #[test]
    fn file_shrunk_after_open_keeps_its_size() {
        let file = temp_file(b"0123456789");
        let mut source = OutputSource::file(file.path());
        file.as_file().set_len(4).unwrap();

        assert_eq!(drain(&mut source, 3), b"0123");
        assert_eq!(source.size(), Some(10));
        assert_eq!(source.position(), 4);
        assert_eq!(source.remaining_bytes(), Some(0));
        assert!(source.is_eof());

        let mut buf = [0u8; 8];
        assert_eq!(source.read_into(&mut buf).unwrap(), ReadOutcome::Eof);
        assert_eq!(source.size(), Some(10));
    }

    #[test]
    fn missing_file_is_an_empty_ready_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = OutputSource::file(dir.path().join("missing.mp3"));

        assert!(source.is_ready());
        assert_eq!(source.size(), Some(0));
        match &source {
            OutputSource::File(f) => assert!(!f.is_open()),
            other => panic!("expected file source, got {other:?}"),
        }
        assert_eq!(drain(&mut source, 8), b"");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deferred
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn deferred_is_not_ready_until_completed() {
        let (mut source, completer) = OutputSource::deferred();
        let mut buf = [0u8; 8];

        assert!(!source.is_ready());
        assert_eq!(source.remaining_bytes(), None);
        assert!(!source.is_eof());
        assert_eq!(source.read_into(&mut buf).unwrap(), ReadOutcome::NotReady);
        assert_eq!(source.seek(3), 0);

        completer.complete("late reply");

        assert!(source.is_ready());
        assert_eq!(source.remaining_bytes(), Some(10));
        assert_eq!(drain(&mut source, 4), b"late reply");
    }

    #[test]
    fn completer_completes_from_another_thread() {
        let (mut source, completer) = OutputSource::deferred();
        std::thread::spawn(move || completer.complete(Bytes::from_static(b"xyz")))
            .join()
            .unwrap();
        assert_eq!(drain(&mut source, 2), b"xyz");
    }

    #[test]
    fn completer_sees_abandoned_source() {
        let (source, completer) = OutputSource::deferred();
        assert!(!completer.is_abandoned());
        drop(source);
        assert!(completer.is_abandoned());
        // Completing an abandoned source is harmless.
        completer.complete("unused");
    }

    #[test]
    fn close_reports_eof() {
        let mut source = OutputSource::memory("abc");
        source.close();
        assert!(source.is_eof());

        let (mut pending, _completer) = OutputSource::deferred();
        pending.close();
        assert!(!pending.is_ready());
    }
}
