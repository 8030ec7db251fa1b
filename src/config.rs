//! Connection configuration.

use std::time::Duration;

/// Tunables for an RDMA stream connection, fixed at construction time.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Bound on each connection-establishment step (address resolution,
    /// route resolution, CM events, SETUP exchange).
    pub resolve_timeout: Duration,
    /// Bound on blocking read/write waits. `None` disables the check.
    pub io_timeout: Option<Duration>,
    /// Ring buffer capacity in bytes (rounded up to the page size).
    pub ring_capacity: usize,
    /// Send/receive queue depth negotiated with the peer.
    pub queue_depth: u16,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            io_timeout: Some(Duration::from_secs(10)),
            ring_capacity: 4 * 1024 * 1024,
            queue_depth: 256,
        }
    }
}

impl ConnConfig {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection-establishment step timeout.
    #[inline]
    pub fn with_resolve_timeout(mut self, t: Duration) -> Self {
        self.resolve_timeout = t;
        self
    }

    /// Set the blocking I/O timeout (`None` = wait forever).
    #[inline]
    pub fn with_io_timeout(mut self, t: Option<Duration>) -> Self {
        self.io_timeout = t;
        self
    }

    /// Set the ring buffer capacity in bytes.
    #[inline]
    pub fn with_ring_capacity(mut self, bytes: usize) -> Self {
        self.ring_capacity = bytes;
        self
    }

    /// Set the queue depth. Depths below 8 leave no room for the credit
    /// split and are clamped.
    #[inline]
    pub fn with_queue_depth(mut self, depth: u16) -> Self {
        self.queue_depth = depth.max(8);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = ConnConfig::new()
            .with_ring_capacity(64 * 1024)
            .with_queue_depth(32)
            .with_io_timeout(None);
        assert_eq!(cfg.ring_capacity, 64 * 1024);
        assert_eq!(cfg.queue_depth, 32);
        assert!(cfg.io_timeout.is_none());
        assert_eq!(cfg.resolve_timeout, Duration::from_secs(5));
    }

    #[test]
    fn tiny_depth_is_clamped() {
        let cfg = ConnConfig::new().with_queue_depth(2);
        assert_eq!(cfg.queue_depth, 8);
    }
}
