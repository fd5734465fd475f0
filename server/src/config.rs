//! Server configuration — all from environment variables.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Who receives `collaborator_frame_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameChangeScope {
    /// Other connections joined to the sender's video.
    #[default]
    Video,
    /// Every other tracked connection, whatever video it is on.
    Global,
}

impl FrameChangeScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "video" => Some(Self::Video),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. `None` runs on the in-memory gateway.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Listen address for WebSocket + REST.
    pub listen_addr: String,
    pub frame_change_scope: FrameChangeScope,
    /// Idle threshold for the stale-session sweeper. Zero disables it.
    pub stale_session_secs: u64,
    pub sweep_interval_secs: u64,
    /// Frames buffered per connection before broadcasts to it are dropped.
    pub outbound_queue_capacity: usize,
    /// Log level filter.
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 20,
            listen_addr: "0.0.0.0:5000".into(),
            frame_change_scope: FrameChangeScope::Video,
            stale_session_secs: 0,
            sweep_interval_secs: 30,
            outbound_queue_capacity: 256,
            log_level: "annocollabd=info,tower_http=info".into(),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            db_max_connections: parsed_var("DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.db_max_connections),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            frame_change_scope: env::var("FRAME_CHANGE_SCOPE")
                .ok()
                .map(|raw| {
                    FrameChangeScope::parse(&raw).unwrap_or_else(|| {
                        warn!(value = %raw, "unknown FRAME_CHANGE_SCOPE, using 'video'");
                        FrameChangeScope::Video
                    })
                })
                .unwrap_or_default(),
            stale_session_secs: parsed_var("STALE_SESSION_SECS")
                .unwrap_or(defaults.stale_session_secs),
            sweep_interval_secs: parsed_var("SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.sweep_interval_secs),
            outbound_queue_capacity: parsed_var("OUTBOUND_QUEUE_CAPACITY")
                .filter(|cap| *cap > 0)
                .unwrap_or(defaults.outbound_queue_capacity),
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        }
    }

    /// Idle threshold for the sweeper, if enabled.
    pub fn stale_session_after(&self) -> Option<Duration> {
        (self.stale_session_secs > 0).then(|| Duration::from_secs(self.stale_session_secs))
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_change_scope_parses_case_insensitively() {
        assert_eq!(FrameChangeScope::parse("video"), Some(FrameChangeScope::Video));
        assert_eq!(FrameChangeScope::parse(" GLOBAL "), Some(FrameChangeScope::Global));
        assert_eq!(FrameChangeScope::parse("room"), None);
    }

    #[test]
    fn sweeper_disabled_by_default() {
        let config = Config::default();
        assert_eq!(config.stale_session_after(), None);
        assert_eq!(config.frame_change_scope, FrameChangeScope::Video);
        assert_eq!(config.outbound_queue_capacity, 256);

        let enabled = Config {
            stale_session_secs: 90,
            ..Config::default()
        };
        assert_eq!(enabled.stale_session_after(), Some(Duration::from_secs(90)));
    }
}
