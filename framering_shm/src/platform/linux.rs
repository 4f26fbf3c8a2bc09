//! Linux-specific shared memory operations

use crate::error::{ShmError, ShmResult};
use framering::consts::DEFAULT_SHM_ROOT;
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Memory mapping configuration for created segments
#[derive(Debug, Clone, Copy)]
pub struct LinuxMemoryConfig {
    /// Pre-fault pages at map time so the first frame does not pay for it
    pub populate: bool,
}

impl Default for LinuxMemoryConfig {
    fn default() -> Self {
        Self { populate: true }
    }
}

/// Device and inode of a mapped object.
///
/// Two mappings of the same name refer to the same object only while their
/// identities match; a writer that recreates a name yields a new identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentIdentity {
    dev: u64,
    ino: u64,
}

/// Directory that backs named segments.
///
/// `/dev/shm` where it exists, the system temp directory otherwise.
pub fn shm_root() -> PathBuf {
    let root = Path::new(DEFAULT_SHM_ROOT);
    if root.is_dir() {
        root.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Filesystem path backing the segment `name`
pub fn segment_path(name: &str) -> PathBuf {
    shm_root().join(name)
}

/// Create a fresh segment of `size` bytes, replacing any previous object.
///
/// The previous object is unlinked rather than truncated so that peers still
/// mapping it never fault on pages that disappeared underneath them.
pub fn create_segment_mmap(
    path: &Path,
    size: usize,
    config: &LinuxMemoryConfig,
) -> ShmResult<(MmapMut, SegmentIdentity)> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Replaced existing segment {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(path)?;

    // New file: set_len zero-fills the whole object
    file.set_len(size as u64)?;

    let mut options = MmapOptions::new();
    if config.populate {
        options.populate();
    }

    let mmap = unsafe { options.map_mut(&file)? };
    let metadata = file.metadata()?;

    Ok((
        mmap,
        SegmentIdentity {
            dev: metadata.dev(),
            ino: metadata.ino(),
        },
    ))
}

/// Attach to an existing segment.
///
/// Returns `Ok(None)` when the object does not exist yet or has not been
/// sized by its creator.
pub fn attach_segment_mmap(path: &Path) -> ShmResult<Option<(MmapMut, SegmentIdentity)>> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(ShmError::Io { source: e });
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if metadata.len() == 0 {
        return Ok(None);
    }

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(Some((
        mmap,
        SegmentIdentity {
            dev: metadata.dev(),
            ino: metadata.ino(),
        },
    )))
}

/// Identity of the object currently bound to `path`, if any
pub fn segment_identity(path: &Path) -> Option<SegmentIdentity> {
    std::fs::metadata(path).ok().map(|m| SegmentIdentity {
        dev: m.dev(),
        ino: m.ino(),
    })
}

/// Unlink `path` if it still refers to `identity`.
///
/// Returns whether the name was removed.
pub fn remove_segment(path: &Path, identity: SegmentIdentity) -> ShmResult<bool> {
    if segment_identity(path) != Some(identity) {
        return Ok(false);
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Why a futex wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken by a peer, or the word already differed from the expected value
    Notified,
    /// Slice elapsed without a wake
    TimedOut,
    /// Interrupted by a signal or spurious wakeup
    Spurious,
}

// Shared (non-private) futex ops: the _PRIVATE variants never wake waiters
// living in another process.
#[cfg(target_os = "linux")]
const FUTEX_WAIT: libc::c_int = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: libc::c_int = 1;

/// Block while `word` still holds `expected`, for at most `timeout`.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> WakeReason {
    use nix::errno::Errno;

    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    // SAFETY: `word` is a live reference for the whole call and the timespec
    // outlives the syscall. The address may sit in a shared mapping, which is
    // what the non-private op expects.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret == 0 {
        return WakeReason::Notified;
    }
    match Errno::last() {
        Errno::ETIMEDOUT => WakeReason::TimedOut,
        Errno::EAGAIN => WakeReason::Notified,
        _ => WakeReason::Spurious,
    }
}

/// Wake every process and thread blocked on `word`.
#[cfg(target_os = "linux")]
pub fn futex_wake_all(word: &AtomicU32) {
    // SAFETY: `word` is a live reference; FUTEX_WAKE only reads the address.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Non-Linux fallback: sleep out the slice and let the caller re-check
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> WakeReason {
    use std::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) != expected {
        return WakeReason::Notified;
    }
    std::thread::sleep(timeout.min(Duration::from_millis(1)));
    WakeReason::Spurious
}

/// Non-Linux fallback: waiters poll, nothing to wake
#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_word: &AtomicU32) {}
