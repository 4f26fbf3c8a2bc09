//! Stream controller: slot acquisition and remap for one mapped stream

use crate::error::{ShmError, ShmResult};
use crate::handle::{Commit, ReadHandle, WriteHandle};
use crate::segment::SegmentMode;
use crate::stats::StreamStats;
use crate::stream_buffer::StreamBuffer;
use framering::config::{StreamConfig, TuningConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Conditions that ask the owner of a stream to rebuild it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// No slot could be write-locked for a whole grace window
    PoolStalled,
    /// The data index mutex could not be taken in time while publishing
    PublishTimeout,
    /// No publication arrived for a whole grace window
    ReaderStalled,
}

impl std::fmt::Display for StreamFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFault::PoolStalled => write!(f, "write pool stalled"),
            StreamFault::PublishTimeout => write!(f, "publish timed out"),
            StreamFault::ReaderStalled => write!(f, "no publication within grace window"),
        }
    }
}

/// Callback receiving stream faults
pub type FaultCallback = Arc<dyn Fn(StreamFault) + Send + Sync>;

/// Timing and retry parameters of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Continuous failure window before a fault is raised
    pub grace_window: Duration,
    /// Attempts made to share-lock a published slot
    pub read_retry_budget: u32,
    /// Bound on taking the data index mutex
    pub index_lock_timeout: Duration,
    /// Cancellation polling slice of index waits
    pub poll_slice: Duration,
}

impl From<&TuningConfig> for StreamOptions {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            grace_window: tuning.grace_window(),
            read_retry_budget: tuning.read_retry_budget,
            index_lock_timeout: tuning.index_lock_timeout(),
            poll_slice: tuning.poll_slice(),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&TuningConfig::default())
    }
}

/// Owns the current mapping of one stream buffer.
///
/// Writers acquire slots round-robin and never block; readers block on the
/// data index, bounded by a timeout. The mapping is swapped under a private
/// mutex on remap. Handles already issued keep the old mapping alive until
/// they are released.
pub struct StreamController {
    name: String,
    mode: SegmentMode,
    buffer: Mutex<Arc<StreamBuffer>>,
    cursor: AtomicU32,
    last_success: Mutex<Instant>,
    fault_raised: AtomicBool,
    observed: AtomicU32,
    options: StreamOptions,
    stats: Arc<StreamStats>,
}

impl StreamController {
    /// Create the stream segment `name` as its writer
    pub fn create(name: &str, config: StreamConfig, options: StreamOptions) -> ShmResult<Self> {
        let buffer = StreamBuffer::create(name, config.pool_size, config.slot_size)?;
        Ok(Self::with_buffer(name, SegmentMode::Creator, buffer, options))
    }

    /// Attach to the stream segment `name` as a reader.
    ///
    /// `Ok(None)` while the writer has not created it yet.
    pub fn attach(name: &str, options: StreamOptions) -> ShmResult<Option<Self>> {
        Ok(StreamBuffer::attach(name)?
            .map(|buffer| Self::with_buffer(name, SegmentMode::Attacher, buffer, options)))
    }

    fn with_buffer(
        name: &str,
        mode: SegmentMode,
        buffer: StreamBuffer,
        options: StreamOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            mode,
            buffer: Mutex::new(Arc::new(buffer)),
            cursor: AtomicU32::new(0),
            last_success: Mutex::new(Instant::now()),
            fault_raised: AtomicBool::new(false),
            observed: AtomicU32::new(0),
            options,
            stats: Arc::new(StreamStats::new()),
        }
    }

    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writer (creator) or reader (attacher) side
    pub fn mode(&self) -> SegmentMode {
        self.mode
    }

    /// Stream options
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Traffic counters
    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Current mapping
    pub fn current(&self) -> Arc<StreamBuffer> {
        Arc::clone(&self.buffer.lock())
    }

    /// Slots in the current mapping
    pub fn pool_size(&self) -> u32 {
        self.buffer.lock().pool_size()
    }

    /// Slot size of the current mapping
    pub fn slot_size(&self) -> u32 {
        self.buffer.lock().slot_size()
    }

    /// Whether the current mapping was removed or replaced by its creator
    pub fn is_stale(&self) -> bool {
        self.buffer.lock().is_stale()
    }

    /// Replace the current mapping.
    ///
    /// The writer recreates its segment under the same name with the same
    /// geometry; a reader reattaches to whatever the name refers to now. A
    /// reader that maps the same object again keeps its read position.
    pub fn remap(&self) -> ShmResult<()> {
        let replaced = self.mode == SegmentMode::Creator || self.is_stale();
        let fresh = match self.mode {
            SegmentMode::Creator => {
                let current = self.current();
                StreamBuffer::create(&self.name, current.pool_size(), current.slot_size())?
            }
            SegmentMode::Attacher => {
                StreamBuffer::attach(&self.name)?.ok_or_else(|| ShmError::NotMapped {
                    name: self.name.clone(),
                })?
            }
        };

        *self.buffer.lock() = Arc::new(fresh);
        self.cursor.store(0, Ordering::Relaxed);
        if replaced {
            self.observed.store(0, Ordering::Release);
        }
        *self.last_success.lock() = Instant::now();
        self.fault_raised.store(false, Ordering::Release);
        self.stats.record_remap();

        tracing::warn!("Remapped stream {} ({:?})", self.name, self.mode);
        Ok(())
    }

    /// Acquire the next free slot for writing.
    ///
    /// Sweeps the pool once starting at the round-robin cursor. If every slot
    /// is busy the attempt fails with [`ShmError::PoolExhausted`], and once
    /// failures have lasted a full grace window `on_fault` receives
    /// [`StreamFault::PoolStalled`] exactly once. Releasing the handle
    /// publishes the slot; a publish timeout is reported through `on_fault`.
    pub fn query_write_buffer(&self, on_fault: &FaultCallback) -> ShmResult<WriteHandle> {
        let buffer = self.current();
        let pool_size = buffer.pool_size();
        let start = self.cursor.load(Ordering::Relaxed) % pool_size;

        for step in 0..pool_size {
            let slot = (start + step) % pool_size;
            if !buffer.handlers()[slot as usize].lock_write() {
                continue;
            }

            self.cursor.store((slot + 1) % pool_size, Ordering::Relaxed);
            *self.last_success.lock() = Instant::now();
            self.fault_raised.store(false, Ordering::Release);

            let stats = Arc::clone(&self.stats);
            let on_fault = Arc::clone(on_fault);
            let lock_timeout = self.options.index_lock_timeout;
            let release = Box::new(move |buffer: &StreamBuffer, index: u32, commit: Commit| {
                buffer.handlers()[index as usize].unlock_write();
                if commit == Commit::Abandon {
                    return Ok(());
                }
                if buffer.data_index().set(index, lock_timeout) {
                    stats.record_published();
                    return Ok(());
                }
                stats.record_publish_failure();
                stats.record_fault();
                tracing::warn!("Publishing slot {} of {} timed out", index, buffer.name());
                on_fault(StreamFault::PublishTimeout);
                Err(ShmError::PublishTimeout {
                    name: buffer.name().to_string(),
                })
            });
            return Ok(WriteHandle::new(buffer, slot, release));
        }

        self.stats.record_write_drop();
        tracing::debug!("All {} slots of {} busy, dropping frame", pool_size, self.name);

        let stalled = self.last_success.lock().elapsed() >= self.options.grace_window;
        if stalled && !self.fault_raised.swap(true, Ordering::AcqRel) {
            self.stats.record_fault();
            tracing::warn!(
                "Write pool of {} stalled for {:?}",
                self.name,
                self.options.grace_window
            );
            on_fault(StreamFault::PoolStalled);
        }

        Err(ShmError::PoolExhausted {
            name: self.name.clone(),
            pool_size,
        })
    }

    /// Wait for the next publication and share-lock its slot.
    ///
    /// `None` on timeout, on cancellation, or when the slot was reclaimed by
    /// the writer before the shared lock succeeded. A miss is not retried:
    /// the caller waits for the next publication.
    pub fn query_read_buffer(
        &self,
        keep_waiting: impl Fn() -> bool,
        timeout: Duration,
    ) -> Option<ReadHandle> {
        let buffer = self.current();
        let mut observed = self.observed.load(Ordering::Acquire);
        let index =
            buffer
                .data_index()
                .wait(&mut observed, keep_waiting, timeout, self.options.poll_slice)?;
        self.observed.store(observed, Ordering::Release);

        if index >= buffer.pool_size()
            || !buffer.handlers()[index as usize].lock_read(self.options.read_retry_budget)
        {
            self.stats.record_read_miss();
            tracing::debug!("Missed publication of slot {} on {}", index, self.name);
            return None;
        }

        self.stats.record_read();
        Some(ReadHandle::new(
            buffer,
            index,
            Box::new(|buffer: &StreamBuffer, index: u32| {
                buffer.handlers()[index as usize].unlock_read();
            }),
        ))
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("options", &self.options)
            .finish()
    }
}
