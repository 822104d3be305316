//! Server configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Let must-exist joins create an absent room instead of failing.
    pub open_room_creation: bool,
    /// Tell the sender when a private message target is gone.
    pub report_unreachable_targets: bool,
    /// Drop a connection after this many seconds without any inbound frame,
    /// pongs included. `0` disables the timeout.
    pub idle_timeout_secs: u64,
    /// Seconds between server pings. Must stay well below
    /// `idle_timeout_secs` so that a quiet but live client keeps answering.
    /// `0` disables pings.
    pub ping_interval_secs: u64,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            open_room_creation: false,
            report_unreachable_targets: true,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SIGNALING_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let config = Self {
            bind_addr: parse_or(&lookup, "SIGNALING_BIND_ADDR", defaults.bind_addr),
            open_room_creation: flag_or(&lookup, "SIGNALING_OPEN_ROOMS", defaults.open_room_creation),
            report_unreachable_targets: flag_or(
                &lookup,
                "SIGNALING_REPORT_UNREACHABLE",
                defaults.report_unreachable_targets,
            ),
            idle_timeout_secs: parse_or(&lookup, "SIGNALING_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            ping_interval_secs: parse_or(&lookup, "SIGNALING_PING_INTERVAL_SECS", defaults.ping_interval_secs),
            max_message_size: parse_or(&lookup, "SIGNALING_MAX_MESSAGE_BYTES", defaults.max_message_size),
        };
        if config.idle_timeout_secs > 0
            && (config.ping_interval_secs == 0 || config.ping_interval_secs >= config.idle_timeout_secs)
        {
            warn!(
                "Ping interval {}s does not fit inside idle timeout {}s; quiet clients will be dropped",
                config.ping_interval_secs, config.idle_timeout_secs
            );
        }
        config
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparseable {}={:?}; using default", key, raw);
                default
            }
        },
        None => default,
    }
}

fn flag_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!("Ignoring unparseable {}={:?}; using default", key, v);
            default
        }
        None => default,
    }
}
