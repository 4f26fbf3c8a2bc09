//! Platform-specific shared memory operations
//!
//! Named segments are files under the shm root mapped with `memmap2`;
//! cross-process wakeups use the Linux futex on a word inside the mapping.

pub mod linux;

pub use linux::{
    LinuxMemoryConfig, SegmentIdentity, WakeReason, attach_segment_mmap, create_segment_mmap,
    futex_wait, futex_wake_all, get_current_pid, remove_segment, segment_identity, segment_path,
    shm_root,
};
