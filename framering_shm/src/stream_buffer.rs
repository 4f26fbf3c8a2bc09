//! Stream buffer region: header, data index, slot locks and slot pool
//!
//! ```text
//! offset 0        [identifier: 16][pool_size: u32][slot_size: u32]
//! offset 64       [DataIndex: 64]
//! next 64-aligned [OwnershipHandler: 64] x pool_size
//! next 64-aligned [slot bytes: slot_size] x pool_size
//! ```
//!
//! The layout carries no version. Both sides derive every offset from
//! `pool_size` and `slot_size`, which the creator stores in the header.

use crate::error::{ShmError, ShmResult};
use crate::segment::{LayoutBuilder, Segment};
use crate::sync::{DataIndex, OwnershipHandler};
use framering::config::StreamConfig;
use framering::consts::{CACHE_LINE_SIZE, IDENTIFIER_LEN, SHM_MAX_SIZE, STREAM_BUFFER_MAGIC};

const POOL_SIZE_OFFSET: usize = IDENTIFIER_LEN;
const SLOT_SIZE_OFFSET: usize = POOL_SIZE_OFFSET + 4;
const HEADER_LEN: usize = SLOT_SIZE_OFFSET + 4;

/// Field offsets of a stream buffer with a given geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLayout {
    /// Number of slots
    pub pool_size: u32,
    /// Bytes per slot
    pub slot_size: u32,
    /// Offset of the [`DataIndex`]
    pub index_offset: usize,
    /// Offset of the first [`OwnershipHandler`]
    pub handlers_offset: usize,
    /// Offset of slot 0
    pub slots_offset: usize,
    /// Page-rounded segment size
    pub total_size: usize,
}

impl StreamLayout {
    /// Compute the layout for `pool_size` slots of `slot_size` bytes.
    pub fn new(pool_size: u32, slot_size: u32) -> ShmResult<Self> {
        StreamConfig::new(pool_size, slot_size)
            .validate()
            .map_err(|e| ShmError::InvalidConfig {
                reason: e.to_string(),
            })?;

        let mut layout = LayoutBuilder::new();
        layout.add_field(HEADER_LEN, 4);
        let index_offset = layout.add_field(
            std::mem::size_of::<DataIndex>(),
            std::mem::align_of::<DataIndex>(),
        );
        let handlers_offset = layout.add_array(
            pool_size as usize,
            std::mem::size_of::<OwnershipHandler>(),
            std::mem::align_of::<OwnershipHandler>(),
        );
        let slots_offset = layout.add_array(pool_size as usize, slot_size as usize, CACHE_LINE_SIZE);

        let total_size = layout.finalize();
        if total_size > SHM_MAX_SIZE {
            return Err(ShmError::InvalidSize { size: total_size });
        }

        Ok(Self {
            pool_size,
            slot_size,
            index_offset,
            handlers_offset,
            slots_offset,
            total_size,
        })
    }

    /// Offset of slot `index`
    pub fn slot_offset(&self, index: u32) -> usize {
        self.slots_offset + index as usize * self.slot_size as usize
    }
}

/// A mapped stream buffer.
///
/// Shared through `Arc` by the controller and every outstanding handle; the
/// mapping lives until the last of them is dropped.
#[derive(Debug)]
pub struct StreamBuffer {
    segment: Segment,
    layout: StreamLayout,
}

impl StreamBuffer {
    /// Create (or replace) the stream segment `name` and initialize it.
    ///
    /// The identifier is stamped last, so a reader never accepts a region
    /// whose header is still being written.
    pub fn create(name: &str, pool_size: u32, slot_size: u32) -> ShmResult<Self> {
        let layout = StreamLayout::new(pool_size, slot_size)?;
        let segment = Segment::create(name, layout.total_size)?;

        segment.write_bytes(POOL_SIZE_OFFSET, &pool_size.to_ne_bytes())?;
        segment.write_bytes(SLOT_SIZE_OFFSET, &slot_size.to_ne_bytes())?;
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        segment.write_bytes(0, &STREAM_BUFFER_MAGIC)?;

        tracing::info!(
            "Created stream buffer {} ({} x {} bytes, {} bytes mapped)",
            name,
            pool_size,
            slot_size,
            layout.total_size
        );
        Ok(Self { segment, layout })
    }

    /// Attach to the stream segment `name`.
    ///
    /// `Ok(None)` if it does not exist yet, [`ShmError::Malformed`] if it
    /// exists but does not hold an initialized stream buffer.
    pub fn attach(name: &str) -> ShmResult<Option<Self>> {
        let Some(segment) = Segment::open(name)? else {
            return Ok(None);
        };
        let malformed = || ShmError::Malformed {
            name: name.to_string(),
        };

        if segment.len() < HEADER_LEN {
            return Err(malformed());
        }
        let mut identifier = [0u8; IDENTIFIER_LEN];
        segment.read_bytes(0, &mut identifier)?;
        if identifier != STREAM_BUFFER_MAGIC {
            return Err(malformed());
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);

        let pool_size = read_u32(&segment, POOL_SIZE_OFFSET)?;
        let slot_size = read_u32(&segment, SLOT_SIZE_OFFSET)?;
        let layout = StreamLayout::new(pool_size, slot_size).map_err(|_| malformed())?;
        if segment.len() < layout.total_size {
            return Err(malformed());
        }

        tracing::debug!(
            "Attached stream buffer {} ({} x {} bytes)",
            name,
            pool_size,
            slot_size
        );
        Ok(Some(Self { segment, layout }))
    }

    /// Segment name
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Number of slots
    pub fn pool_size(&self) -> u32 {
        self.layout.pool_size
    }

    /// Bytes per slot
    pub fn slot_size(&self) -> u32 {
        self.layout.slot_size
    }

    /// Region layout
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    /// Underlying segment
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Whether the segment name now refers to another object (or none)
    pub fn is_stale(&self) -> bool {
        self.segment.is_stale()
    }

    /// The publication index of this stream
    pub fn data_index(&self) -> &DataIndex {
        // SAFETY: `index_offset` is 64-aligned inside a page-aligned mapping
        // that was checked to cover the whole layout and lives as long as
        // `self`. DataIndex is made of atomics only, so concurrent access from
        // other processes is sound, and the zero-filled initial state is valid.
        unsafe { &*(self.segment.base().add(self.layout.index_offset) as *const DataIndex) }
    }

    /// The slot locks, one per slot
    pub fn handlers(&self) -> &[OwnershipHandler] {
        // SAFETY: same argument as `data_index`: aligned, in bounds, atomics
        // only, valid when zeroed.
        unsafe {
            std::slice::from_raw_parts(
                self.segment.base().add(self.layout.handlers_offset) as *const OwnershipHandler,
                self.layout.pool_size as usize,
            )
        }
    }

    /// Start of slot `index`.
    ///
    /// Dereferencing is only sound while holding that slot's lock in the
    /// matching mode.
    pub(crate) fn slot_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.layout.pool_size);
        // SAFETY: slot offsets stay inside the layout checked at construction.
        unsafe { self.segment.base().add(self.layout.slot_offset(index)) }
    }
}

fn read_u32(segment: &Segment, offset: usize) -> ShmResult<u32> {
    let mut raw = [0u8; 4];
    segment.read_bytes(offset, &mut raw)?;
    Ok(u32::from_ne_bytes(raw))
}
