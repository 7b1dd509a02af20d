/// Application name
pub const APP_NAME: &str = "SkyTalk";

/// Wire protocol revision advertised by `/info`
pub const PROTOCOL_VERSION: &str = "skytalk/1";

/// Maximum text body length in characters
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Username length bounds in characters
pub const MIN_USERNAME_CHARS: usize = 3;
pub const MAX_USERNAME_CHARS: usize = 32;

/// Messages returned per conversation fetch
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Outbound event buffer per connection
pub const CONNECTION_BUFFER: usize = 64;

/// Client-side idle period before emitting `stop-typing`
pub const CLIENT_TYPING_IDLE_MS: u64 = 2_000;

/// Server-side fallback that clears a stale typing indicator
pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 5_000;

/// Interval between server WebSocket pings
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 25;

/// A connection silent for this long is treated as gone
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default HTTP / WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 4000;

/// Access credential lifetime (15 minutes)
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Refresh credential lifetime (7 days)
pub const REFRESH_TOKEN_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Maximum attachment size in bytes (10 MiB)
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;
