//! Prelude module for common re-exports.
//!
//! ```rust
//! use framering_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, SessionConfig, StreamConfig, TuningConfig,
};

// ─── Segment Constants ──────────────────────────────────────────────
pub use crate::consts::{CACHE_LINE_SIZE, SHM_MAX_SIZE, SHM_MIN_SIZE};
