//! Fixed protocol and I/O constants.
//!
//! Wire-level values are defined by the device protocol and by HTTP/1.0 and
//! must not be changed. I/O sizing values are the defaults that
//! [`ReactorConfig`](crate::config::ReactorConfig) starts from.

// ─────────────────────────────────────────────────────────────────────────────
// Reactor I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes received from a socket in one read (32 KiB).
///
/// Larger inbound messages are handled over several reactor iterations.
pub const DEFAULT_READ_CHUNK: usize = 1 << 15;

/// Bytes pulled from the head output source and sent in one write pass (32 KiB).
///
/// Small enough that one large file transfer cannot starve other connections
/// on the same reactor.
pub const DEFAULT_WRITE_CHUNK: usize = 1 << 15;

/// Upper bound on the reactor's blocking readiness wait (milliseconds).
///
/// Cross-thread state changes are guaranteed to be observed within this
/// interval even if a wake-up is lost, and the stop flag is checked at least
/// this often.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 2000;

/// Default connection capacity per reactor.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Listen backlog passed to `listen(2)`.
pub const LISTEN_BACKLOG: i32 = 128;

/// Event buffer capacity for one `poll` call.
pub const EVENTS_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Device protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Default TCP port for the device-control protocol.
pub const DEFAULT_SLIM_PORT: u16 = 3483;

/// Client frame header: 4-byte opcode + 4-byte big-endian payload length.
pub const SLIM_CLIENT_HEADER_LEN: usize = 8;

/// Inbound buffer bound for the device protocol (bytes).
///
/// Device messages are small; anything larger is dropped.
pub const SLIM_MAX_INBOUND: usize = 4096;

/// Fixed parameter block of a `strm` command, before the optional HTTP request.
pub const STRM_PARAMS_LEN: usize = 24;

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// Default TCP port for the HTTP protocol.
pub const DEFAULT_HTTP_PORT: u16 = 9000;

/// Maximum size of an HTTP request head (bytes).
pub const HTTP_MAX_REQUEST_HEAD: usize = 8192;

/// Path devices use to fetch the current track of their group.
pub const STREAM_PATH: &str = "/stream.mp3";

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Group every device follows unless a saved setting says otherwise.
pub const DEFAULT_GROUP: &str = "all";

/// Volume assigned to a device seen for the first time (0-100).
pub const DEFAULT_VOLUME: u8 = 50;

/// Persisted playlist groups, relative to the data directory.
pub const PLAYLISTS_FILE: &str = "playlists.json";

/// Persisted per-player settings, relative to the data directory.
pub const PLAYERS_FILE: &str = "players.json";
