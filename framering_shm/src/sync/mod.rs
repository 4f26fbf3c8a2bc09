//! Cross-process synchronization primitives placed inside shared memory
//!
//! Both types are plain atomics with `repr(C)` layout. An all-zero region is
//! a valid initial state for each, so a freshly created segment needs no
//! in-place construction.

pub mod data_index;
pub mod ownership;

pub use data_index::DataIndex;
pub use ownership::{LockState, OwnershipHandler};
