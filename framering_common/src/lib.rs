//! framering Common Library
//!
//! Shared constants and configuration loading for the framering workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Segment limits, region identifiers and default timings
//! - [`config`] - Session/stream configuration and TOML loading
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! framering = { package = "framering_common", path = "../framering_common" }
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
