//! Constants for the framering shared memory transport.
//!
//! These values are the single source of truth for segment sizing, the
//! identifiers stamped into every region, and the default timings used by
//! the stream and session layers. Every timing can be overridden through
//! [`TuningConfig`](crate::config::TuningConfig).

use static_assertions::const_assert;

/// Minimum shared memory segment size in bytes.
///
/// One memory page. Every segment is rounded up to a multiple of this.
pub const SHM_MIN_SIZE: usize = 4096;

/// Maximum shared memory segment size in bytes (1GB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// CPU cache line size in bytes.
///
/// Sync words living in shared memory are padded to this to avoid false
/// sharing between the writer process and reader processes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Length of every region identifier (stream ids and magic constants).
pub const IDENTIFIER_LEN: usize = 16;

/// Identifier stamped at offset 0 of every stream buffer.
pub const STREAM_BUFFER_MAGIC: [u8; IDENTIFIER_LEN] = *b"FRAMERING:STRM01";

/// Identifier stamped at offset 0 of every session buffer.
pub const SESSION_BUFFER_MAGIC: [u8; IDENTIFIER_LEN] = *b"FRAMERING:SESS01";

/// Directory backing named segments on Linux.
pub const DEFAULT_SHM_ROOT: &str = "/dev/shm";

/// Longest accepted segment name, in bytes.
pub const MAX_SEGMENT_NAME_LEN: usize = 255;

/// Continuous-failure window after which a stream reports a fault (ms).
pub const DEFAULT_GRACE_WINDOW_MS: u64 = 2000;

/// Attempts made by a shared (read) slot lock before giving up.
pub const DEFAULT_READ_RETRY_BUDGET: u32 = 10;

/// Bound on acquiring the data index mutex when publishing (ms).
pub const DEFAULT_INDEX_LOCK_TIMEOUT_MS: u64 = 2000;

/// Polling slice of a blocked index wait; bounds cancellation latency (ms).
pub const DEFAULT_POLL_SLICE_MS: u64 = 10;

/// Per-cycle wait of a stream reader thread (ms).
pub const DEFAULT_READER_WAIT_TIMEOUT_MS: u64 = 100;

/// Interval between session discovery passes on the reader side (ms).
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 100;

const_assert!(SHM_MIN_SIZE < SHM_MAX_SIZE);
const_assert!(CACHE_LINE_SIZE.is_power_of_two());
const_assert!(SHM_MIN_SIZE % CACHE_LINE_SIZE == 0);
const_assert!(DEFAULT_POLL_SLICE_MS < DEFAULT_READER_WAIT_TIMEOUT_MS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_min_size_is_page_size() {
        assert_eq!(SHM_MIN_SIZE, 4096);
    }

    #[test]
    fn test_magics_are_distinct() {
        assert_ne!(STREAM_BUFFER_MAGIC, SESSION_BUFFER_MAGIC);
        assert_ne!(STREAM_BUFFER_MAGIC, [0u8; IDENTIFIER_LEN]);
    }

    #[test]
    fn test_observed_defaults() {
        assert_eq!(DEFAULT_GRACE_WINDOW_MS, 2000);
        assert_eq!(DEFAULT_READ_RETRY_BUDGET, 10);
        assert_eq!(DEFAULT_INDEX_LOCK_TIMEOUT_MS, 2000);
        assert_eq!(DEFAULT_POLL_SLICE_MS, 10);
    }
}
