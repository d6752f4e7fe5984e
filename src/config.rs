//! Servent configuration
//!
//! Process-wide port constants plus the tunables every subsystem reads.
//! The ports are handed to the hidden-service control channel when the
//! onion address is published and to outgoing dials.

use std::fmt;

/// Virtual port peers dial for file transfer sessions.
pub const PORT_P2P: u16 = 4128;

/// Virtual port servents dial to reach an index server.
pub const PORT_C2S: u16 = 4129;

/// Configuration for a servent
#[derive(Clone)]
pub struct Config {
    /// Chunk size for outgoing file streams (bytes)
    /// Default: 8192
    pub transfer_chunk_size: usize,

    /// Concurrent outgoing transfers admitted per peer connection
    /// Default: 8
    pub transfer_queue_depth: usize,

    /// Documents per batch during a full-inventory publish
    /// Default: 512
    pub publish_batch_size: usize,

    /// Supervisor status-poll interval while a login is pending (seconds)
    /// Default: 3
    pub status_poll_interval_secs: u64,

    /// Approvals held per memoizer generation before rotation
    /// Default: 32768
    pub max_cache_entries: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("transfer_chunk_size", &self.transfer_chunk_size)
            .field("transfer_queue_depth", &self.transfer_queue_depth)
            .field("publish_batch_size", &self.publish_batch_size)
            .field("status_poll_interval_secs", &self.status_poll_interval_secs)
            .field("max_cache_entries", &self.max_cache_entries)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transfer_chunk_size: 1 << 13,
            transfer_queue_depth: 8,
            publish_batch_size: 512,
            status_poll_interval_secs: 3,
            max_cache_entries: 1 << 15,
        }
    }
}

impl Config {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outgoing file-stream chunk size
    pub fn with_transfer_chunk_size(mut self, bytes: usize) -> Self {
        self.transfer_chunk_size = bytes;
        self
    }

    /// Set the per-connection transfer admission depth
    pub fn with_transfer_queue_depth(mut self, depth: usize) -> Self {
        self.transfer_queue_depth = depth;
        self
    }

    /// Set the full-inventory publish batch size
    pub fn with_publish_batch_size(mut self, docs: usize) -> Self {
        self.publish_batch_size = docs;
        self
    }

    /// Set the pending-login status poll interval
    pub fn with_status_poll_interval(mut self, secs: u64) -> Self {
        self.status_poll_interval_secs = secs;
        self
    }

    /// Set the memoizer generation bound
    pub fn with_max_cache_entries(mut self, entries: usize) -> Self {
        self.max_cache_entries = entries;
        self
    }

    /// Configuration for testing (small batches, fast polls)
    pub fn for_testing() -> Self {
        Self {
            transfer_chunk_size: 64,
            transfer_queue_depth: 8,
            publish_batch_size: 4,
            status_poll_interval_secs: 1,
            max_cache_entries: 4,
        }
    }
}
