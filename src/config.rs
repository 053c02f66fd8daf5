use serde::Deserialize;
use std::{num::NonZeroUsize, time::Duration};

/// Endpoint tuning knobs.
///
/// Deserializable with every field optional, so it can sit inside an
/// application's own config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Handler executions allowed to run at once per inbound stream.
    /// `None` removes the cap; requests on a stream then all run concurrently.
    pub max_in_flight: Option<NonZeroUsize>,
    /// How long to wait for the session to open the outbound call stream.
    pub open_timeout: Duration,
    /// Interval between yamux keepalive pings; `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// yamux gives up on the connection when a write stalls this long.
    pub write_timeout: Duration,
    /// Upper bound on concurrently open streams in the session.
    pub max_streams: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_in_flight: NonZeroUsize::new(64),
            open_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(30)),
            write_timeout: Duration::from_secs(10),
            max_streams: 1024,
        }
    }
}

impl Config {
    pub(crate) fn session_config(&self) -> tokio_yamux::Config {
        let defaults = tokio_yamux::Config::default();
        tokio_yamux::Config {
            enable_keepalive: self.keepalive_interval.is_some(),
            keepalive_interval: self
                .keepalive_interval
                .unwrap_or(defaults.keepalive_interval),
            connection_write_timeout: self.write_timeout,
            max_stream_count: self.max_streams,
            ..defaults
        }
    }
}
