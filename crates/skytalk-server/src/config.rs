//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use skytalk_shared::constants::{
    ACCESS_TOKEN_TTL_SECS, APP_NAME, DEFAULT_HISTORY_LIMIT, DEFAULT_HTTP_PORT,
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PING_INTERVAL_SECS, DEFAULT_TYPING_TIMEOUT_MS,
    MAX_FILE_SIZE, REFRESH_TOKEN_TTL_SECS,
};

const DEV_JWT_SECRET: &str = "skytalk-dev-access-secret";
const DEV_JWT_REFRESH_SECRET: &str = "skytalk-dev-refresh-secret";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for HTTP and WebSocket traffic.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:4000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./skytalk.db`
    pub database_path: PathBuf,

    /// Directory for uploaded attachments.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./uploads`
    pub blob_storage_path: PathBuf,

    /// Env: `MAX_BLOB_SIZE`
    /// Default: 10 MiB
    pub max_blob_size: usize,

    /// Prefix for the URLs handed out by the upload endpoint.
    /// Env: `PUBLIC_URL`
    /// Default: `http://localhost:4000`
    pub public_url: String,

    /// Env: `JWT_SECRET`
    pub jwt_secret: String,

    /// Env: `JWT_REFRESH_SECRET`
    pub jwt_refresh_secret: String,

    /// Env: `ACCESS_TOKEN_TTL_SECS`
    /// Default: 900
    pub access_token_ttl_secs: i64,

    /// Env: `REFRESH_TOKEN_TTL_SECS`
    /// Default: 604800
    pub refresh_token_ttl_secs: i64,

    /// How long a typing indicator lives without a fresh `typing` event.
    /// Env: `TYPING_TIMEOUT_MS`
    /// Default: 5000
    pub typing_timeout: Duration,

    /// Env: `PING_INTERVAL_SECS`
    /// Default: 25
    pub ping_interval: Duration,

    /// Silence after which a WebSocket is closed and the user goes offline.
    /// Env: `IDLE_TIMEOUT_SECS`
    /// Default: 60
    pub idle_timeout: Duration,

    /// Messages returned per conversation fetch.
    /// Env: `HISTORY_LIMIT`
    /// Default: 100
    pub history_limit: u32,

    /// Whether `POST /api/auth/register` may create accounts.
    /// Env: `ALLOW_REGISTRATION`
    /// Default: `true`
    pub allow_registration: bool,

    /// Env: `INSTANCE_NAME`
    /// Default: `"SkyTalk"`
    pub instance_name: String,

    /// Sustained client events per second per user.
    /// Env: `EVENT_RATE_PER_SEC`
    /// Default: 20
    pub event_rate_per_sec: f64,

    /// Env: `EVENT_BURST`
    /// Default: 40
    pub event_burst: f64,

    /// Sustained HTTP requests per second per client address.
    /// Env: `HTTP_RATE_PER_SEC`
    /// Default: 10
    pub http_rate_per_sec: f64,

    /// Env: `HTTP_BURST`
    /// Default: 30
    pub http_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("blob_storage_path", &self.blob_storage_path)
            .field("max_blob_size", &self.max_blob_size)
            .field("public_url", &self.public_url)
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("typing_timeout", &self.typing_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("history_limit", &self.history_limit)
            .field("allow_registration", &self.allow_registration)
            .field("instance_name", &self.instance_name)
            .field("event_rate_per_sec", &self.event_rate_per_sec)
            .field("event_burst", &self.event_burst)
            .field("http_rate_per_sec", &self.http_rate_per_sec)
            .field("http_burst", &self.http_burst)
            .finish_non_exhaustive()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./skytalk.db"),
            blob_storage_path: PathBuf::from("./uploads"),
            max_blob_size: MAX_FILE_SIZE,
            public_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_refresh_secret: DEV_JWT_REFRESH_SECRET.to_string(),
            access_token_ttl_secs: ACCESS_TOKEN_TTL_SECS,
            refresh_token_ttl_secs: REFRESH_TOKEN_TTL_SECS,
            typing_timeout: Duration::from_millis(DEFAULT_TYPING_TIMEOUT_MS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            allow_registration: true,
            instance_name: APP_NAME.to_string(),
            event_rate_per_sec: 20.0,
            event_burst: 40.0,
            http_rate_per_sec: 10.0,
            http_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        parse_into(&lookup, "MAX_BLOB_SIZE", &mut config.max_blob_size);

        if let Some(url) = lookup("PUBLIC_URL") {
            config.public_url = url.trim_end_matches('/').to_string();
        }

        if let Some(secret) = lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            config.jwt_secret = secret;
        }

        if let Some(secret) = lookup("JWT_REFRESH_SECRET").filter(|s| !s.is_empty()) {
            config.jwt_refresh_secret = secret;
        }

        parse_into(&lookup, "ACCESS_TOKEN_TTL_SECS", &mut config.access_token_ttl_secs);
        parse_into(&lookup, "REFRESH_TOKEN_TTL_SECS", &mut config.refresh_token_ttl_secs);

        let mut typing_ms = config.typing_timeout.as_millis() as u64;
        parse_into(&lookup, "TYPING_TIMEOUT_MS", &mut typing_ms);
        config.typing_timeout = Duration::from_millis(typing_ms);

        let mut ping_secs = config.ping_interval.as_secs();
        parse_into(&lookup, "PING_INTERVAL_SECS", &mut ping_secs);
        let mut idle_secs = config.idle_timeout.as_secs();
        parse_into(&lookup, "IDLE_TIMEOUT_SECS", &mut idle_secs);
        if ping_secs == 0 || idle_secs <= ping_secs {
            tracing::warn!(
                ping_secs,
                idle_secs,
                "Idle timeout must exceed a non-zero ping interval, using defaults"
            );
        } else {
            config.ping_interval = Duration::from_secs(ping_secs);
            config.idle_timeout = Duration::from_secs(idle_secs);
        }

        parse_into(&lookup, "HISTORY_LIMIT", &mut config.history_limit);

        parse_into(&lookup, "ALLOW_REGISTRATION", &mut config.allow_registration);

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        parse_into(&lookup, "EVENT_RATE_PER_SEC", &mut config.event_rate_per_sec);
        parse_into(&lookup, "EVENT_BURST", &mut config.event_burst);
        parse_into(&lookup, "HTTP_RATE_PER_SEC", &mut config.http_rate_per_sec);
        parse_into(&lookup, "HTTP_BURST", &mut config.http_burst);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// True while either signing secret is still the built-in development
    /// value.
    pub fn uses_dev_secrets(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET || self.jwt_refresh_secret == DEV_JWT_REFRESH_SECRET
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 4000).into());
        assert_eq!(config.history_limit, 100);
        assert_eq!(config.typing_timeout, Duration::from_secs(5));
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.uses_dev_secrets());
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("JWT_SECRET", "a"),
            ("JWT_REFRESH_SECRET", "b"),
            ("TYPING_TIMEOUT_MS", "250"),
            ("PUBLIC_URL", "https://chat.example.com/"),
            ("ALLOW_REGISTRATION", "false"),
        ]));
        assert!(!config.allow_registration);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.typing_timeout, Duration::from_millis(250));
        assert_eq!(config.public_url, "https://chat.example.com");
        assert!(!config.uses_dev_secrets());
    }

    #[test]
    fn test_invalid_value_keeps_default() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("HISTORY_LIMIT", "-3"),
        ]));
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 4000).into());
        assert_eq!(config.history_limit, 100);
    }

    #[test]
    fn test_keep_alive_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PING_INTERVAL_SECS", "10"),
            ("IDLE_TIMEOUT_SECS", "30"),
        ]));
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));

        let inverted = ServerConfig::from_lookup(lookup(&[
            ("PING_INTERVAL_SECS", "30"),
            ("IDLE_TIMEOUT_SECS", "10"),
        ]));
        assert_eq!(inverted.ping_interval, Duration::from_secs(25));
        assert_eq!(inverted.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", ServerConfig::default());
        assert!(!rendered.contains(DEV_JWT_SECRET));
    }
}
