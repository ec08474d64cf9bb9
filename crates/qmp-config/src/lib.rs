//! Shared configuration for the monitor control client and its CLI.
//!
//! Values are layered by `ortho_config`: built-in defaults, then an optional
//! configuration file (`--config-path`), then `QMP_*` environment variables,
//! then command-line flags. The protocol engine never reads configuration
//! itself; callers map a loaded [`Config`] onto connection options.

mod choices;
mod defaults;
mod socket;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EVENT_QUEUE_CAPACITY,
    DEFAULT_LOG_FILTER, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_TCP_PORT, default_event_overflow,
    default_log_filter, default_log_filter_string, default_log_format, default_socket_endpoint,
};
pub use choices::{ChoiceParseError, EventOverflow, LogFormat};
pub use socket::{SocketEndpoint, SocketParseError};

/// Configuration shared by every consumer of the monitor client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "QMP")]
#[serde(default)]
pub struct Config {
    /// Address of the monitor control socket.
    pub monitor_socket: SocketEndpoint,
    /// Deadline for connecting and receiving the greeting, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Deadline for each command, in milliseconds. Zero waits indefinitely.
    pub command_timeout_ms: u64,
    /// Whether to request out-of-band execution during negotiation.
    pub request_oob: bool,
    /// Bounded length of each event subscriber queue.
    pub event_queue_capacity: usize,
    /// What happens to events that arrive while a subscriber queue is full.
    pub event_overflow: EventOverflow,
    /// Number of recent events replayed to new subscribers.
    pub event_replay: usize,
    /// Largest accepted inbound message, in bytes.
    pub max_message_bytes: usize,
    /// Tracing filter expression.
    pub log_filter: String,
    /// Tracing output format.
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_socket: default_socket_endpoint(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            request_oob: true,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            event_overflow: default_event_overflow(),
            event_replay: 0,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Monitor socket endpoint.
    #[must_use]
    pub const fn monitor_socket(&self) -> &SocketEndpoint {
        &self.monitor_socket
    }

    /// Connect and greeting deadline.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-command deadline, or `None` when commands may wait indefinitely.
    #[must_use]
    pub const fn command_timeout(&self) -> Option<Duration> {
        if self.command_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.command_timeout_ms))
        }
    }

    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Tracing output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn zero_command_timeout_disables_deadline() {
        let config = Config {
            command_timeout_ms: 0,
            ..Config::default()
        };

        assert_eq!(config.command_timeout(), None);
    }

    #[rstest]
    fn defaults_request_oob_without_replay() {
        let config = Config::default();

        assert!(config.request_oob);
        assert_eq!(config.event_replay, 0);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(30)));
    }
}
