//! # framering Shared Memory Transport
//!
//! Moves high-rate binary payloads such as video frames from one producer
//! process to any number of consumer processes on the same machine, through
//! named shared memory segments and without a broker.
//!
//! ## Features
//!
//! - **Zero-copy slots**: writers fill a slot in place, readers borrow it in place
//! - **Never blocks the producer**: slot locks are try-locks, a full pool drops the frame
//! - **Most-recent-wins**: a slow reader skips to the latest publication
//! - **Self-healing**: stalled pools and restarted peers trigger a remap, not a restart
//! - **Discovery**: sessions advertise their streams and can be listed or purged
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────────────┐    ┌─────────────────┐
//! │ SessionWriter   │    │ Session buffer           │    │ SessionReader   │
//! │                 ├───►│ [magic|count|ids...]     ├───►│ (discovery      │
//! │ StreamWriter xN │    └──────────────────────────┘    │  thread)        │
//! │                 │    ┌──────────────────────────┐    │                 │
//! │ query_write_    ├───►│ Stream buffer (per id)   ├───►│ StreamReader xN │
//! │   buffer(i)     │    │ [header|DataIndex|       │    │ (one delivery   │
//! └─────────────────┘    │  locks...|slots...]      │    │  thread each)   │
//!                        └──────────────────────────┘    └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Producer
//!
//! ```rust,no_run
//! use framering_shm::{SessionWriter, ShmError};
//! use framering::config::{StreamConfig, TuningConfig};
//!
//! # fn main() -> Result<(), ShmError> {
//! let writer = SessionWriter::new(
//!     "camera_rig",
//!     &[StreamConfig::new(4, 1920 * 1080 * 3)],
//!     &TuningConfig::default(),
//! )?;
//!
//! match writer.query_write_buffer(0) {
//!     Ok(mut slot) => {
//!         slot.copy_from(b"frame bytes");
//!         slot.release(); // publishes
//!     }
//!     Err(e) if e.is_transient() => { /* every slot busy: drop this frame */ }
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Consumer
//!
//! ```rust,no_run
//! use framering_shm::{ReadHandle, SessionReader, ShmError};
//! use framering::config::TuningConfig;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), ShmError> {
//! let reader = SessionReader::new("camera_rig", Some(1), &TuningConfig::default())?;
//! reader.on_buffer().subscribe(Arc::new(|stream: usize, frame: &ReadHandle| {
//!     println!("stream {stream}: slot {} ({} bytes)", frame.index(), frame.len());
//! }));
//! reader.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **StreamWriter / SessionWriter**: `Sync`, but designed for one producing thread
//! - **StreamReader / SessionReader**: events fire on background threads they own
//! - **Handles**: release their slot on every path, including panics
//!
//! ## Platform Support
//!
//! Segments are files under `/dev/shm` (the temp directory elsewhere). Waits
//! use the Linux futex on a word inside the mapping; other platforms fall
//! back to sleeping for one polling slice.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod handle;
pub mod platform;
pub mod reader;
pub mod segment;
pub mod session;
pub mod stats;
pub mod stream_buffer;
pub mod sync;
pub mod writer;

pub use controller::{FaultCallback, StreamController, StreamFault, StreamOptions};
pub use discovery::{SessionDiscovery, SessionInfo, StreamInfo};
pub use error::{ShmError, ShmResult};
pub use events::{EventRegistry, SubscriptionId};
pub use handle::{Commit, ReadHandle, WriteHandle};
pub use reader::{BufferFn, StreamReader};
pub use segment::{LayoutBuilder, Segment, SegmentMode};
pub use session::{
    SessionBuffer, SessionBufferFn, SessionErrorFn, SessionReader, SessionWriter,
    stream_segment_name,
};
pub use stats::{StreamStats, StreamStatsSnapshot};
pub use stream_buffer::{StreamBuffer, StreamLayout};
pub use sync::{DataIndex, LockState, OwnershipHandler};
pub use writer::{StreamErrorFn, StreamWriter};

pub use framering::consts::{SHM_MAX_SIZE, SHM_MIN_SIZE};

use framering::config::LogLevel;

/// Initialize tracing, filtered by `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize tracing at `level` unless `RUST_LOG` overrides it
pub fn init_tracing_with(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
