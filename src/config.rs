//! Environment-driven configuration for the server and the client sync core.
//!
//! DESIGN
//! ======
//! Every knob has a `DEFAULT_*` constant and an environment variable. Missing
//! or unparseable values fall back to the default so a bare environment
//! always yields a working configuration. A zero duration counts as
//! unparseable: every duration here drives a timer or a timeout.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_DB_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_AUTOSAVE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 2_000;
const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PERSISTENCE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SAVE_WHEN_DISCONNECTED: bool = true;

/// Shortest period handed to a timer.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Parse an environment variable, falling back to `default` when it is
/// missing or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key).map_or(default, |v| v.trim().parse::<T>().unwrap_or(default))
}

/// Parse a millisecond duration; zero falls back to `default_ms` too.
pub(crate) fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    match env_parse(key, default_ms) {
        0 => Duration::from_millis(default_ms),
        ms => Duration::from_millis(ms),
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Settings for the persistence + relay server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Postgres URL. `None` selects the in-memory snapshot store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// How long a request waits for a pooled connection.
    pub db_acquire_timeout: Duration,
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL")
                .into_iter()
                .find(|url| !url.trim().is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            db_acquire_timeout: env_duration_ms("DB_ACQUIRE_TIMEOUT_MS", DEFAULT_DB_ACQUIRE_TIMEOUT_MS),
        }
    }
}

// =============================================================================
// CLIENT SESSION
// =============================================================================

/// Tuning knobs for one open whiteboard session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the persistence endpoint, e.g. `https://host`.
    pub base_url: String,
    /// How often the autosave timer checks the dirty flag.
    pub autosave_interval: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// Remote peers silent for longer than this are pruned.
    pub presence_timeout: Duration,
    /// Upper bound for one persistence round-trip.
    pub persistence_timeout: Duration,
    /// Upper bound for opening the relay socket, handshake included.
    pub connect_timeout: Duration,
    /// Whether autosave ticks may save while the transport is disconnected.
    pub save_when_disconnected: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("WHITEBOARD_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned()),
            autosave_interval: env_duration_ms("AUTOSAVE_INTERVAL_MS", DEFAULT_AUTOSAVE_INTERVAL_MS),
            reconnect_backoff: env_duration_ms("RECONNECT_BACKOFF_MS", DEFAULT_RECONNECT_BACKOFF_MS),
            presence_timeout: env_duration_ms("PRESENCE_TIMEOUT_MS", DEFAULT_PRESENCE_TIMEOUT_MS),
            persistence_timeout: env_duration_ms("PERSISTENCE_TIMEOUT_MS", DEFAULT_PERSISTENCE_TIMEOUT_MS),
            connect_timeout: env_duration_ms("CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            save_when_disconnected: env_parse("SAVE_WHEN_DISCONNECTED", DEFAULT_SAVE_WHEN_DISCONNECTED),
        }
    }

    /// Heartbeat period for re-publishing the local awareness state.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        (self.presence_timeout / 2).max(MIN_TIMER_PERIOD)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            autosave_interval: Duration::from_millis(DEFAULT_AUTOSAVE_INTERVAL_MS),
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            presence_timeout: Duration::from_millis(DEFAULT_PRESENCE_TIMEOUT_MS),
            persistence_timeout: Duration::from_millis(DEFAULT_PERSISTENCE_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            save_when_disconnected: DEFAULT_SAVE_WHEN_DISCONNECTED,
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
