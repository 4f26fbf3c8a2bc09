//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment does not exist yet; readers poll until a writer creates it
    #[error("Segment not mapped yet: {name}")]
    NotMapped {
        /// Segment name
        name: String,
    },

    /// Segment exists but its identifier or size does not describe a valid region
    #[error("Segment is malformed or uninitialized: {name}")]
    Malformed {
        /// Segment name
        name: String,
    },

    /// No slot could be write-locked during a full sweep of the pool
    #[error("All {pool_size} slots of {name} are busy")]
    PoolExhausted {
        /// Segment name
        name: String,
        /// Number of slots swept
        pool_size: u32,
    },

    /// The publication mutex could not be acquired in time (stuck peer)
    #[error("Publishing to {name} timed out")]
    PublishTimeout {
        /// Segment name
        name: String,
    },

    /// Segment name is not usable as an OS shared memory object name
    #[error("Invalid segment name: {name:?}")]
    InvalidName {
        /// Rejected name
        name: String,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes (must be 1..=1GB)")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Invalid pool geometry or tuning
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong
        reason: String,
    },

    /// Stream index outside the session
    #[error("Stream index {index} out of range (session has {count} streams)")]
    StreamIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Streams in the session
        count: usize,
    },

    /// Session advertises a different number of streams than expected
    #[error("Session {name} advertises {found} streams, expected {expected}")]
    StreamCountMismatch {
        /// Session name
        name: String,
        /// Expected stream count
        expected: usize,
        /// Advertised stream count
        found: usize,
    },

    /// Background thread already running
    #[error("Already running: {what}")]
    AlreadyRunning {
        /// Component that was started twice
        what: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },

    /// Configuration error
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: framering::config::ConfigError,
    },
}

impl ShmError {
    /// Whether the condition is handled locally by retrying on a later cycle.
    ///
    /// Absent or malformed segments, pool exhaustion and lost slot races never
    /// abort the calling thread. Publish timeouts are structural and drive a
    /// remap instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShmError::NotMapped { .. } | ShmError::Malformed { .. } | ShmError::PoolExhausted { .. }
        )
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ShmError::NotMapped { name: "a".into() }.is_transient());
        assert!(ShmError::Malformed { name: "a".into() }.is_transient());
        assert!(
            ShmError::PoolExhausted {
                name: "a".into(),
                pool_size: 4
            }
            .is_transient()
        );
        assert!(!ShmError::PublishTimeout { name: "a".into() }.is_transient());
        assert!(!ShmError::InvalidSize { size: 0 }.is_transient());
    }
}
