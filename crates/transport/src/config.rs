use std::time::Duration;

/// Tuning knobs for a [`Conn`](crate::Conn).
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnConfig {
    /// Deadline applied to each `read` call. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Deadline applied to each `write` call. `None` waits indefinitely.
    pub write_timeout: Option<Duration>,
    /// Whether messages above the compression threshold are
    /// snappy-compressed. Enabled once the protocol-level hello exchange
    /// shows both ends support it.
    pub snappy: bool,
}
