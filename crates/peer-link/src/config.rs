use std::env;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_CHUNK_CHARS: usize = 5_000;
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 16 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ZOMBIE_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_LINK_RECOVERY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_SIGNALING_RECOVERY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_CHANNEL_ID: u16 = 1;
pub const DEFAULT_CHANNEL_LABEL: &str = "peer-link";

/// Slices must be longer than the terminator so a slice can never be
/// mistaken for it.
const MIN_CHUNK_CHARS: usize = 2;

/// Manager configuration, passed in at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Log every envelope at debug instead of trace.
    pub verbose: bool,
    pub chunk_chars: usize,
    pub max_message_chars: usize,
    pub request_timeout: Duration,
    pub zombie_grace: Duration,
    /// Delay before a hard reset after a link-level disconnect.
    pub link_recovery_delay: Duration,
    /// Delay before a hard reset after a negotiation error.
    pub signaling_recovery_delay: Duration,
    pub channel_id: u16,
    pub channel_label: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            chunk_chars: DEFAULT_CHUNK_CHARS,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            zombie_grace: DEFAULT_ZOMBIE_GRACE,
            link_recovery_delay: DEFAULT_LINK_RECOVERY_DELAY,
            signaling_recovery_delay: DEFAULT_SIGNALING_RECOVERY_DELAY,
            channel_id: DEFAULT_CHANNEL_ID,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl ManagerConfig {
    /// Defaults overlaid with `PEER_LINK_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            verbose: parse_bool_env("PEER_LINK_VERBOSE", defaults.verbose),
            chunk_chars: parse_usize_env(
                "PEER_LINK_CHUNK_CHARS",
                defaults.chunk_chars,
                MIN_CHUNK_CHARS,
            ),
            max_message_chars: parse_usize_env(
                "PEER_LINK_MAX_MESSAGE_CHARS",
                defaults.max_message_chars,
                MIN_CHUNK_CHARS,
            ),
            request_timeout: parse_millis_env(
                "PEER_LINK_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
            ),
            zombie_grace: parse_millis_env("PEER_LINK_ZOMBIE_GRACE_MS", defaults.zombie_grace),
            link_recovery_delay: parse_millis_env(
                "PEER_LINK_LINK_RECOVERY_MS",
                defaults.link_recovery_delay,
            ),
            signaling_recovery_delay: parse_millis_env(
                "PEER_LINK_SIGNALING_RECOVERY_MS",
                defaults.signaling_recovery_delay,
            ),
            channel_id: defaults.channel_id,
            channel_label: env::var("PEER_LINK_CHANNEL_LABEL")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.channel_label),
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(MIN_CHUNK_CHARS);
        self
    }
}

fn parse_bool_env(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(value) => match value.trim() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!(var, value = other, default, "unrecognised boolean; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(var, parsed, min, default, "config value below minimum; using default");
                default
            }
            Err(err) => {
                warn!(var, error = %err, default, "failed to parse config from env; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_millis_env(var: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    match env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(parsed) => Duration::from_millis(parsed),
            Err(err) => {
                warn!(var, error = %err, default_ms, "failed to parse duration from env; using default");
                default
            }
        },
        Err(_) => default,
    }
}
