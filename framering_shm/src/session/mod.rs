//! Sessions: named groups of streams with discovery and restart handling

pub mod buffer;
pub mod reader;
pub mod writer;

use crate::controller::StreamFault;
use crate::handle::ReadHandle;

pub use buffer::{SessionBuffer, stream_segment_name};
pub use reader::SessionReader;
pub use writer::SessionWriter;

/// Subscriber to session buffer events: `(stream_index, handle)`
pub type SessionBufferFn = dyn Fn(usize, &ReadHandle) + Send + Sync;

/// Subscriber to session fault events: `(stream_index, fault)`
pub type SessionErrorFn = dyn Fn(usize, StreamFault) + Send + Sync;
