use std::time::Duration;

/// Tunable parameters for a single [`crate::connection::Conn`].
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Capacity of the buffered reader placed in front of the transport's read half.
    pub read_buffer_capacity: usize,
    /// Capacity of the buffered writer placed in front of the transport's write half.
    pub write_buffer_capacity: usize,
    /// Internal deadline applied to close and control-frame writes (ping responses, Close).
    pub control_write_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            read_buffer_capacity: 8 * 1024,
            write_buffer_capacity: 8 * 1024,
            control_write_timeout: Duration::from_secs(5),
        }
    }
}
