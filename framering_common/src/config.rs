//! Configuration loading traits and types.
//!
//! A session is described by a TOML file naming the session, listing one
//! `[[streams]]` table per logical stream and optionally overriding the
//! transport timings under `[tuning]`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use framering_common::config::{ConfigLoader, SessionConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = SessionConfig::load(Path::new("session.toml"))?;
//!     config.validate()?;
//!     println!("Session: {} ({} streams)", config.name, config.streams.len());
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_DISCOVERY_INTERVAL_MS, DEFAULT_GRACE_WINDOW_MS, DEFAULT_INDEX_LOCK_TIMEOUT_MS,
    DEFAULT_POLL_SLICE_MS, DEFAULT_READ_RETRY_BUDGET, DEFAULT_READER_WAIT_TIMEOUT_MS,
    MAX_SEGMENT_NAME_LEN, SHM_MAX_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Bytes a stream segment name adds to its session name (`_` + 32 hex digits).
pub const STREAM_NAME_SUFFIX_LEN: usize = 33;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, per-cycle tracing of slot traffic.
    Trace,
    /// Debug information such as dropped frames and read misses.
    Debug,
    /// Attach, create and shutdown events.
    #[default]
    Info,
    /// Remaps and session regenerations.
    Warn,
    /// Hard failures only.
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Geometry of one logical stream: how many slots and how large each is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Number of slots in the ring.
    pub pool_size: u32,
    /// Size of each slot in bytes.
    pub slot_size: u32,
}

impl StreamConfig {
    /// Create a stream description.
    pub const fn new(pool_size: u32, slot_size: u32) -> Self {
        Self {
            pool_size,
            slot_size,
        }
    }

    /// Validate the geometry.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if either dimension is zero or
    /// the slot array alone would exceed the maximum segment size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.slot_size == 0 {
            return Err(ConfigError::ValidationError(
                "slot_size must be at least 1".to_string(),
            ));
        }
        let payload = self.pool_size as u64 * self.slot_size as u64;
        if payload > SHM_MAX_SIZE as u64 {
            return Err(ConfigError::ValidationError(format!(
                "{} slots of {} bytes exceed the {} byte segment limit",
                self.pool_size, self.slot_size, SHM_MAX_SIZE
            )));
        }
        Ok(())
    }
}

/// Transport timings. Every field defaults to the observed production value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Continuous failure window before a stream raises a fault.
    pub grace_window_ms: u64,
    /// Attempts made by a shared slot lock.
    pub read_retry_budget: u32,
    /// Bound on acquiring the publication mutex.
    pub index_lock_timeout_ms: u64,
    /// Polling slice of a blocked index wait.
    pub poll_slice_ms: u64,
    /// Per-cycle wait of a reader thread.
    pub reader_wait_timeout_ms: u64,
    /// Interval between session discovery passes.
    pub discovery_interval_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: DEFAULT_GRACE_WINDOW_MS,
            read_retry_budget: DEFAULT_READ_RETRY_BUDGET,
            index_lock_timeout_ms: DEFAULT_INDEX_LOCK_TIMEOUT_MS,
            poll_slice_ms: DEFAULT_POLL_SLICE_MS,
            reader_wait_timeout_ms: DEFAULT_READER_WAIT_TIMEOUT_MS,
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
        }
    }
}

impl TuningConfig {
    /// Grace window as a `Duration`.
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    /// Publication mutex bound as a `Duration`.
    pub fn index_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.index_lock_timeout_ms)
    }

    /// Wait polling slice as a `Duration`.
    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }

    /// Reader per-cycle wait as a `Duration`.
    pub fn reader_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_wait_timeout_ms)
    }

    /// Discovery interval as a `Duration`.
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Validate the timings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for zero slices or budgets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_retry_budget == 0 {
            return Err(ConfigError::ValidationError(
                "read_retry_budget must be at least 1".to_string(),
            ));
        }
        if self.poll_slice_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_slice_ms must be at least 1".to_string(),
            ));
        }
        if self.discovery_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "discovery_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named session and its streams.
///
/// # TOML Example
///
/// ```toml
/// name = "camera_rig"
/// log_level = "debug"
///
/// [[streams]]
/// pool_size = 4
/// slot_size = 8294400
///
/// [tuning]
/// grace_window_ms = 1500
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session name; doubles as the session segment name.
    pub name: String,

    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// One entry per logical stream, in stream index order.
    pub streams: Vec<StreamConfig>,

    /// Transport timings.
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl SessionConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `name` is empty, too long, or contains `/` or NUL
    /// - no stream is declared, or a stream geometry is invalid
    /// - a tuning value is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_session_name(&self.name)?;
        if self.streams.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one stream is required".to_string(),
            ));
        }
        for (index, stream) in self.streams.iter().enumerate() {
            stream.validate().map_err(|e| match e {
                ConfigError::ValidationError(msg) => {
                    ConfigError::ValidationError(format!("stream {index}: {msg}"))
                }
                other => other,
            })?;
        }
        self.tuning.validate()
    }
}

/// Check that `name` can prefix every stream segment name of a session.
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` describing the first violation.
pub fn validate_session_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::ValidationError(
            "session name cannot be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(ConfigError::ValidationError(format!(
            "session name cannot contain '/' or NUL: {name:?}"
        )));
    }
    if name == "." || name == ".." {
        return Err(ConfigError::ValidationError(format!(
            "session name cannot be a directory entry: {name:?}"
        )));
    }
    if name.len() + STREAM_NAME_SUFFIX_LEN > MAX_SEGMENT_NAME_LEN {
        return Err(ConfigError::ValidationError(format!(
            "session name too long ({} bytes, max {})",
            name.len(),
            MAX_SEGMENT_NAME_LEN - STREAM_NAME_SUFFIX_LEN
        )));
    }
    Ok(())
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `serde::de::DeserializeOwned` type.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn session(name: &str) -> SessionConfig {
        SessionConfig {
            name: name.to_string(),
            log_level: LogLevel::Info,
            streams: vec![StreamConfig::new(4, 1024)],
            tuning: TuningConfig::default(),
        }
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warn.as_directive(), "warn");
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize)]
        struct Wrapper {
            level: LogLevel,
        }

        let parsed = toml::from_str::<Wrapper>("level = \"trace\"").unwrap();
        assert_eq!(parsed.level, LogLevel::Trace);
        assert!(toml::from_str::<Wrapper>("level = \"loud\"").is_err());
    }

    #[test]
    fn test_stream_config_validation() {
        assert!(StreamConfig::new(4, 64).validate().is_ok());
        assert!(StreamConfig::new(0, 64).validate().is_err());
        assert!(StreamConfig::new(4, 0).validate().is_err());
        assert!(StreamConfig::new(u32::MAX, u32::MAX).validate().is_err());
    }

    #[test]
    fn test_tuning_rejects_zero_budget() {
        let tuning = TuningConfig {
            read_retry_budget: 0,
            ..TuningConfig::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        assert_eq!(TuningConfig::default().grace_window(), Duration::from_secs(2));
    }

    #[test]
    fn test_session_name_rules() {
        assert!(session("camera_rig").validate().is_ok());
        assert!(session("").validate().is_err());
        assert!(session("a/b").validate().is_err());
        assert!(matches!(
            validate_session_name("."),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(validate_session_name("..").is_err());
        assert!(validate_session_name("..rig").is_ok());
        assert!(session(&"x".repeat(MAX_SEGMENT_NAME_LEN)).validate().is_err());
    }

    #[test]
    fn test_session_without_streams_is_invalid() {
        let mut config = session("empty");
        config.streams.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = SessionConfig::load(Path::new("/nonexistent/path/session.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = SessionConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_loader_success() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"name = "camera_rig"
log_level = "debug"

[[streams]]
pool_size = 4
slot_size = 1024

[[streams]]
pool_size = 2
slot_size = 64

[tuning]
grace_window_ms = 1500
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "camera_rig");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.streams, vec![StreamConfig::new(4, 1024), StreamConfig::new(2, 64)]);
        assert_eq!(config.tuning.grace_window_ms, 1500);
        assert_eq!(config.tuning.read_retry_budget, DEFAULT_READ_RETRY_BUDGET);
        assert!(config.validate().is_ok());
    }
}
