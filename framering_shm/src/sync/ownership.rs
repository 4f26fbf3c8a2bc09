//! Per-slot reader/writer lock living in shared memory

use std::sync::atomic::{AtomicU32, Ordering};

/// Lock word value while a writer owns the slot
const WRITE_LOCKED: u32 = u32::MAX;

/// Largest number of concurrent shared holders
const MAX_READERS: u32 = WRITE_LOCKED - 1;

/// Observable state of a slot lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the slot
    Free,
    /// One writer holds the slot exclusively
    Write,
    /// `n >= 1` readers share the slot
    Read(u32),
}

/// Reader/writer try-lock over a single 32-bit word.
///
/// `0` is free, `u32::MAX` is write-locked, anything else counts shared
/// holders. Nothing here ever blocks: a peer that dies while holding the
/// slot can stall that slot, never the caller.
///
/// The type is placed directly in shared memory. An all-zero word is a valid
/// free lock, so a freshly zero-filled segment needs no construction.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct OwnershipHandler {
    state: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<OwnershipHandler>() == 64);

impl OwnershipHandler {
    /// Create a free lock (used for in-process tests and benches)
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Try to take the slot exclusively.
    ///
    /// Fails immediately if any exclusive or shared holder exists.
    #[inline]
    pub fn lock_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITE_LOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the exclusive hold taken by a successful [`lock_write`](Self::lock_write).
    #[inline]
    pub fn unlock_write(&self) {
        let previous = self.state.swap(0, Ordering::Release);
        debug_assert_eq!(previous, WRITE_LOCKED, "unlock_write without write lock");
    }

    /// Try to take a shared hold, retrying up to `retries` times.
    ///
    /// Retries absorb a writer that is just committing the slot; if the
    /// budget runs out the caller skips this publication.
    pub fn lock_read(&self, retries: u32) -> bool {
        for attempt in 0..retries.max(1) {
            let current = self.state.load(Ordering::Relaxed);
            if current < MAX_READERS
                && self
                    .state
                    .compare_exchange(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return true;
            }

            if attempt < 2 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        false
    }

    /// Release one shared hold.
    #[inline]
    pub fn unlock_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(
            previous != 0 && previous != WRITE_LOCKED,
            "unlock_read without read lock"
        );
    }

    /// Snapshot of the current state
    pub fn state(&self) -> LockState {
        match self.state.load(Ordering::Acquire) {
            0 => LockState::Free,
            WRITE_LOCKED => LockState::Write,
            n => LockState::Read(n),
        }
    }
}

impl Default for OwnershipHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_write_excludes_everything() {
        let lock = OwnershipHandler::new();
        assert!(lock.lock_write());
        assert_eq!(lock.state(), LockState::Write);
        assert!(!lock.lock_write());
        assert!(!lock.lock_read(10));
        lock.unlock_write();
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    fn test_readers_share_and_block_writer() {
        let lock = OwnershipHandler::new();
        assert!(lock.lock_read(10));
        assert!(lock.lock_read(10));
        assert_eq!(lock.state(), LockState::Read(2));
        assert!(!lock.lock_write());

        lock.unlock_read();
        assert!(!lock.lock_write());
        lock.unlock_read();
        assert!(lock.lock_write());
    }

    #[test]
    fn test_zeroed_word_is_free() {
        let lock: OwnershipHandler = unsafe { std::mem::zeroed() };
        assert_eq!(lock.state(), LockState::Free);
        assert!(lock.lock_write());
    }

    #[test]
    fn test_concurrent_writers_never_overlap() {
        let lock = Arc::new(OwnershipHandler::new());
        let inside = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        if lock.lock_write() {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            inside.fetch_sub(1, Ordering::SeqCst);
                            lock.unlock_write();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.state(), LockState::Free);
    }

    #[derive(Debug, Clone)]
    enum Op {
        LockWrite,
        UnlockWrite,
        LockRead,
        UnlockRead,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::LockWrite),
            Just(Op::UnlockWrite),
            Just(Op::LockRead),
            Just(Op::UnlockRead),
        ]
    }

    proptest! {
        // Lock state always matches a model of {free, write, read(n)}.
        #[test]
        fn prop_lock_state_is_exclusive(ops in proptest::collection::vec(op(), 1..200)) {
            let lock = OwnershipHandler::new();
            let mut writer = false;
            let mut readers = 0u32;

            for op in ops {
                match op {
                    Op::LockWrite => {
                        let ok = lock.lock_write();
                        prop_assert_eq!(ok, !writer && readers == 0);
                        if ok { writer = true; }
                    }
                    Op::UnlockWrite => if writer {
                        lock.unlock_write();
                        writer = false;
                    },
                    Op::LockRead => {
                        let ok = lock.lock_read(3);
                        prop_assert_eq!(ok, !writer);
                        if ok { readers += 1; }
                    }
                    Op::UnlockRead => if readers > 0 {
                        lock.unlock_read();
                        readers -= 1;
                    },
                }

                let expected = match (writer, readers) {
                    (false, 0) => LockState::Free,
                    (true, 0) => LockState::Write,
                    (false, n) => LockState::Read(n),
                    (true, _) => unreachable!("model violated mutual exclusion"),
                };
                prop_assert_eq!(lock.state(), expected);
            }
        }
    }
}
