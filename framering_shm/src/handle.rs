//! Zero-copy slot handles
//!
//! A handle is the caller's exclusive (write) or shared (read) claim on one
//! slot. It keeps the stream buffer it was issued from alive, so a remap
//! never pulls the mapping out from under it, and it always releases the
//! slot lock: explicitly through `release`, or on drop.

use crate::error::ShmResult;
use crate::stream_buffer::StreamBuffer;
use std::sync::Arc;

/// What releasing a write handle does with the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Unlock and announce the slot to readers
    Publish,
    /// Unlock without announcing
    Abandon,
}

pub(crate) type WriteRelease = Box<dyn FnOnce(&StreamBuffer, u32, Commit) -> ShmResult<()> + Send>;
pub(crate) type ReadRelease = Box<dyn FnOnce(&StreamBuffer, u32) + Send>;

/// Exclusive view of one slot
pub struct WriteHandle {
    buffer: Arc<StreamBuffer>,
    index: u32,
    release: Option<WriteRelease>,
}

impl WriteHandle {
    pub(crate) fn new(buffer: Arc<StreamBuffer>, index: u32, release: WriteRelease) -> Self {
        Self {
            buffer,
            index,
            release: Some(release),
        }
    }

    /// Slot index within the pool
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot capacity in bytes
    pub fn len(&self) -> usize {
        self.buffer.slot_size() as usize
    }

    /// Always false: slots have a non-zero size
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: this handle holds the slot's write lock until release, and
        // `buffer` keeps the mapping alive for the borrow.
        unsafe { std::slice::from_raw_parts(self.buffer.slot_ptr(self.index), self.len()) }
    }

    /// Mutable slot contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive write lock held, see `as_slice`.
        unsafe { std::slice::from_raw_parts_mut(self.buffer.slot_ptr(self.index), self.len()) }
    }

    /// Copy `data` to the start of the slot, returning the bytes written.
    ///
    /// Data longer than the slot is truncated.
    pub fn copy_from(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.len());
        self.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        n
    }

    /// Stream buffer this handle was issued from
    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }

    /// Unlock the slot and publish it to readers.
    ///
    /// A publish timeout is still reported to the stream's fault callback.
    pub fn release(mut self) {
        let _ = self.finish(Commit::Publish);
    }

    /// Like [`release`](Self::release), but also returns
    /// [`ShmError::PublishTimeout`](crate::ShmError::PublishTimeout) when the
    /// slot was unlocked and never announced.
    pub fn try_release(mut self) -> ShmResult<()> {
        self.finish(Commit::Publish)
    }

    /// Unlock the slot without publishing (the frame is dropped)
    pub fn abandon(mut self) {
        let _ = self.finish(Commit::Abandon);
    }

    fn finish(&mut self, commit: Commit) -> ShmResult<()> {
        match self.release.take() {
            Some(release) => release(&self.buffer, self.index, commit),
            None => Ok(()),
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        let _ = self.finish(Commit::Publish);
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("stream", &self.buffer.name())
            .field("index", &self.index)
            .finish()
    }
}

/// Shared view of one published slot
pub struct ReadHandle {
    buffer: Arc<StreamBuffer>,
    index: u32,
    release: Option<ReadRelease>,
}

impl ReadHandle {
    pub(crate) fn new(buffer: Arc<StreamBuffer>, index: u32, release: ReadRelease) -> Self {
        Self {
            buffer,
            index,
            release: Some(release),
        }
    }

    /// Slot index within the pool
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot size in bytes
    pub fn len(&self) -> usize {
        self.buffer.slot_size() as usize
    }

    /// Always false: slots have a non-zero size
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: a shared lock on the slot is held until release, which
        // excludes writers; `buffer` keeps the mapping alive.
        unsafe { std::slice::from_raw_parts(self.buffer.slot_ptr(self.index), self.len()) }
    }

    /// Stream buffer this handle was issued from
    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }

    /// Drop the shared lock
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.buffer, self.index);
        }
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("stream", &self.buffer.name())
            .field("index", &self.index)
            .finish()
    }
}
