//! Cross-process "latest ready slot" announcement

use crate::platform::{futex_wait, futex_wake_all};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Attempts made to take a consistent `(sequence, index)` snapshot
const SNAPSHOT_RETRIES: u32 = 10;

/// Sequence value meaning "nothing published yet"
const UNPUBLISHED: u32 = 0;

/// Guarded `(sequence_id, published_index)` pair in shared memory.
///
/// Publishers serialize through `lock` with a bounded acquire, bump
/// `sequence` and wake every waiter blocked on it. Waiters accept a value
/// only when `sequence` differs from the one they last observed.
///
/// `sequence` wraps from `u32::MAX` to 1; 0 is reserved for "never
/// published". All-zero memory is a valid, unlocked, unpublished index.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct DataIndex {
    lock: AtomicU32,
    sequence: AtomicU32,
    index: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<DataIndex>() == 64);

/// Releases the publication mutex on drop
struct IndexGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for IndexGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

impl DataIndex {
    /// Create an unpublished index (used for in-process tests and benches)
    pub const fn new() -> Self {
        Self {
            lock: AtomicU32::new(0),
            sequence: AtomicU32::new(UNPUBLISHED),
            index: AtomicU32::new(0),
        }
    }

    /// Publish `index`.
    ///
    /// Returns `false` if the mutex could not be taken within `lock_timeout`,
    /// which means a peer died or stalled while publishing. Callers treat
    /// that as the signal to remap.
    pub fn set(&self, index: u32, lock_timeout: Duration) -> bool {
        let Some(guard) = self.acquire(lock_timeout) else {
            return false;
        };

        let mut next = self.sequence.load(Ordering::Relaxed).wrapping_add(1);
        if next == UNPUBLISHED {
            next = 1;
        }
        self.index.store(index, Ordering::Relaxed);
        self.sequence.store(next, Ordering::Release);
        drop(guard);

        futex_wake_all(&self.sequence);
        true
    }

    /// Block until a publication newer than `observed` appears.
    ///
    /// Returns the published index and advances `observed`, or `None` if
    /// `keep_waiting` turns false or `timeout` elapses first. The predicate is
    /// re-checked every `slice`, so cancellation latency is bounded by it
    /// whatever the wake mechanism does.
    pub fn wait(
        &self,
        observed: &mut u32,
        keep_waiting: impl Fn() -> bool,
        timeout: Duration,
        slice: Duration,
    ) -> Option<u32> {
        let deadline = Instant::now() + timeout;

        loop {
            if !keep_waiting() {
                return None;
            }

            let (sequence, index) = self.snapshot();
            if sequence != UNPUBLISHED && sequence != *observed {
                *observed = sequence;
                return Some(index);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            futex_wait(&self.sequence, sequence, slice.min(deadline - now));
        }
    }

    /// Last published index without waiting, `None` before the first publish
    pub fn get(&self) -> Option<u32> {
        match self.snapshot() {
            (UNPUBLISHED, _) => None,
            (_, index) => Some(index),
        }
    }

    /// Current sequence id (0 before the first publish)
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Best-effort consistent read of the pair.
    ///
    /// Retries while a publish is in flight; if the mutex stays held (dead
    /// publisher) the last read wins rather than spinning forever.
    fn snapshot(&self) -> (u32, u32) {
        let mut sequence = self.sequence.load(Ordering::Acquire);
        let mut index = self.index.load(Ordering::Relaxed);

        for _ in 0..SNAPSHOT_RETRIES {
            let locked = self.lock.load(Ordering::Acquire) != 0;
            let confirm = self.sequence.load(Ordering::Acquire);
            if !locked && confirm == sequence {
                break;
            }
            std::hint::spin_loop();
            sequence = self.sequence.load(Ordering::Acquire);
            index = self.index.load(Ordering::Relaxed);
        }
        (sequence, index)
    }

    fn acquire(&self, timeout: Duration) -> Option<IndexGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;

        loop {
            if self
                .lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(IndexGuard { lock: &self.lock });
            }
            if Instant::now() >= deadline {
                return None;
            }

            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else if spins < 128 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }

    /// Take the publication mutex without ever releasing it, as a crashed
    /// publisher would leave it.
    #[cfg(test)]
    pub(crate) fn poison_for_test(&self) {
        self.lock.store(1, Ordering::Release);
    }
}

impl Default for DataIndex {
    fn default() -> Self {
        Self::new()
    }
}
