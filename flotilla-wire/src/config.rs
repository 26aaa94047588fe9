//! Buffer sizing knobs for wire sockets.
//!
//! Tuning these values can significantly impact performance based on
//! workload; the broker and worker runtime both move small JSON envelopes,
//! so the defaults favor request/reply latency over raw throughput.

/// Default read buffer size (8KB), used for arena-allocated reads.
pub const DEFAULT_READ_BUF_SIZE: usize = 8192;

/// Default write buffer size (8KB).
pub const DEFAULT_WRITE_BUF_SIZE: usize = 8192;

/// Small read buffer size (4KB), for short request/reply round-trips.
pub const SMALL_READ_BUF_SIZE: usize = 4096;

/// Small write buffer size (4KB).
pub const SMALL_WRITE_BUF_SIZE: usize = 4096;

/// Large read buffer size (16KB), for workers streaming bigger payloads.
pub const LARGE_READ_BUF_SIZE: usize = 16384;

/// Large write buffer size (16KB).
pub const LARGE_WRITE_BUF_SIZE: usize = 16384;

/// Initial staging buffer capacity for decoder reassembly (256 bytes).
///
/// Only used when a frame spans multiple reads (slow path).
pub const STAGING_BUF_INITIAL_CAP: usize = 256;

/// Socket buffer configuration.
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub read_buf_size: usize,
    pub write_buf_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            write_buf_size: DEFAULT_WRITE_BUF_SIZE,
        }
    }
}

impl BufferConfig {
    /// Optimized for small request/reply envelopes (the common case).
    #[must_use]
    pub const fn small() -> Self {
        Self {
            read_buf_size: SMALL_READ_BUF_SIZE,
            write_buf_size: SMALL_WRITE_BUF_SIZE,
        }
    }

    /// Optimized for workers exchanging larger payloads.
    #[must_use]
    pub const fn large() -> Self {
        Self {
            read_buf_size: LARGE_READ_BUF_SIZE,
            write_buf_size: LARGE_WRITE_BUF_SIZE,
        }
    }

    #[must_use]
    pub const fn custom(read_buf_size: usize, write_buf_size: usize) -> Self {
        Self {
            read_buf_size,
            write_buf_size,
        }
    }
}
