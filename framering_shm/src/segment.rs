//! Named shared memory segments and region layout helpers

use crate::error::{ShmError, ShmResult};
use crate::platform::{
    LinuxMemoryConfig, SegmentIdentity, attach_segment_mmap, create_segment_mmap, remove_segment,
    segment_identity, segment_path,
};
use framering::consts::{CACHE_LINE_SIZE, MAX_SEGMENT_NAME_LEN, SHM_MAX_SIZE, SHM_MIN_SIZE};
use memmap2::MmapMut;
use std::path::{Path, PathBuf};

/// How this process relates to a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// Created the object; removes its name when dropped
    Creator,
    /// Attached to an object created elsewhere
    Attacher,
}

/// A named, OS-backed shared memory mapping.
///
/// The OS object outlives this mapping: readers may keep an attached mapping
/// after the creator is gone, and a creator may replace the name at any time.
pub struct Segment {
    name: String,
    path: PathBuf,
    mode: SegmentMode,
    identity: SegmentIdentity,
    base: *mut u8,
    len: usize,
    _mmap: MmapMut,
}

// SAFETY: `base` points into `_mmap`, which lives exactly as long as the
// segment. Everything reached through it is either guarded by the
// cross-process slot locks or accessed atomically.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new zero-filled segment of exactly `size` bytes.
    ///
    /// Any existing object with this name is replaced. Failure here is a hard
    /// error: without its segment a writer cannot provide service.
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        validate_segment_name(name)?;
        validate_segment_size(size)?;

        let path = segment_path(name);
        let (mut mmap, identity) =
            create_segment_mmap(&path, size, &LinuxMemoryConfig::default())?;
        validate_memory_alignment(mmap.as_ptr() as usize)?;

        let base = mmap.as_mut_ptr();
        tracing::debug!("Created segment {} ({} bytes)", name, size);

        Ok(Self {
            name: name.to_string(),
            path,
            mode: SegmentMode::Creator,
            identity,
            base,
            len: size,
            _mmap: mmap,
        })
    }

    /// Attach to an existing segment.
    ///
    /// Returns `Ok(None)` if nothing is mapped under `name` yet; callers are
    /// expected to poll.
    pub fn open(name: &str) -> ShmResult<Option<Self>> {
        validate_segment_name(name)?;

        let path = segment_path(name);
        let Some((mut mmap, identity)) = attach_segment_mmap(&path)? else {
            return Ok(None);
        };
        validate_memory_alignment(mmap.as_ptr() as usize)?;

        let base = mmap.as_mut_ptr();
        let len = mmap.len();

        Ok(Some(Self {
            name: name.to_string(),
            path,
            mode: SegmentMode::Attacher,
            identity,
            base,
            len,
            _mmap: mmap,
        }))
    }

    /// Like [`Segment::open`], but an absent segment is an error.
    pub fn open_existing(name: &str) -> ShmResult<Self> {
        Self::open(name)?.ok_or_else(|| ShmError::NotMapped {
            name: name.to_string(),
        })
    }

    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creator or attacher
    pub fn mode(&self) -> SegmentMode {
        self.mode
    }

    /// Mapped size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a valid segment)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Whether the name no longer refers to the object this mapping views.
    ///
    /// True once the creator removed or replaced it; the mapping itself stays
    /// readable, but no peer will publish into it again.
    pub fn is_stale(&self) -> bool {
        segment_identity(&self.path) != Some(self.identity)
    }

    /// Copy `out.len()` bytes starting at `offset` out of the mapping.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> ShmResult<()> {
        self.check_range(offset, out.len())?;
        // SAFETY: range checked against the mapping length above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> ShmResult<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked against the mapping length above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> ShmResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmError::InvalidSize {
                size: offset.saturating_add(len),
            }),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.mode != SegmentMode::Creator {
            return;
        }
        match remove_segment(&self.path, self.identity) {
            Ok(true) => tracing::debug!("Removed segment {}", self.name),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to remove segment {}: {}", self.name, e),
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("len", &self.len)
            .finish()
    }
}

/// Validate segment size constraints
pub fn validate_segment_size(size: usize) -> ShmResult<()> {
    if size == 0 || size > SHM_MAX_SIZE {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

/// Validate that `name` is usable as a shared memory object name
pub fn validate_segment_name(name: &str) -> ShmResult<()> {
    if name.is_empty()
        || name.len() > MAX_SEGMENT_NAME_LEN
        || name.contains('/')
        || name.contains('\0')
        || name == "."
        || name == ".."
    {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate memory alignment
pub fn validate_memory_alignment(address: usize) -> ShmResult<()> {
    if address % CACHE_LINE_SIZE != 0 {
        return Err(ShmError::InvalidSize { size: address });
    }
    Ok(())
}

/// Round `size` up to a whole number of pages
pub fn page_aligned_size(size: usize) -> usize {
    align_up(size, SHM_MIN_SIZE)
}

/// Round `value` up to a multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Computes field offsets for a region laid out inside a segment.
///
/// Fields are appended in order, each aligned to its own requirement, which
/// gives a fixed, versionless layout both peers derive independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutBuilder {
    offset: usize,
}

impl LayoutBuilder {
    /// Start an empty layout at offset 0
    pub fn new() -> Self {
        Self { offset: 0 }
    }

    /// Append a field and return its offset
    pub fn add_field(&mut self, size: usize, align: usize) -> usize {
        self.offset = align_up(self.offset, align);
        let field_offset = self.offset;
        self.offset += size;
        field_offset
    }

    /// Append `count` contiguous elements and return the array offset
    pub fn add_array(&mut self, count: usize, elem_size: usize, align: usize) -> usize {
        self.add_field(count * elem_size, align)
    }

    /// Bytes used so far
    pub fn len(&self) -> usize {
        self.offset
    }

    /// Whether nothing has been added yet
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Total segment size: used bytes rounded up to whole pages
    pub fn finalize(&self) -> usize {
        page_aligned_size(self.offset.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;

    fn unique(tag: &str) -> String {
        format!("framering_segment_{}_{}", tag, get_current_pid())
    }

    #[test]
    fn test_segment_size_validation() {
        assert!(validate_segment_size(1).is_ok());
        assert!(validate_segment_size(SHM_MIN_SIZE).is_ok());
        assert!(validate_segment_size(0).is_err());
        assert!(validate_segment_size(SHM_MAX_SIZE + 1).is_err());
    }

    #[test]
    fn test_segment_name_validation() {
        assert!(validate_segment_name("camera_0").is_ok());
        assert!(validate_segment_name("").is_err());
        assert!(validate_segment_name("a/b").is_err());
        assert!(validate_segment_name("..").is_err());
        assert!(validate_segment_name(&"n".repeat(MAX_SEGMENT_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_layout_builder_alignment() {
        let mut layout = LayoutBuilder::new();
        assert_eq!(layout.add_field(24, 4), 0);
        assert_eq!(layout.add_field(64, 64), 64);
        assert_eq!(layout.add_array(3, 64, 64), 128);
        assert_eq!(layout.add_array(2, 10, 64), 320);
        assert_eq!(layout.len(), 340);
        assert_eq!(layout.finalize(), SHM_MIN_SIZE);
    }

    #[test]
    fn test_open_absent_segment_is_not_an_error() {
        let segment = Segment::open(&unique("absent")).unwrap();
        assert!(segment.is_none());
        assert!(matches!(
            Segment::open_existing(&unique("absent")),
            Err(ShmError::NotMapped { .. })
        ));
    }

    #[test]
    fn test_create_open_and_staleness() {
        let name = unique("stale");
        let writer = Segment::create(&name, SHM_MIN_SIZE).unwrap();
        assert_eq!(writer.mode(), SegmentMode::Creator);
        writer.write_bytes(100, b"frame").unwrap();

        let reader = Segment::open(&name).unwrap().unwrap();
        assert_eq!(reader.mode(), SegmentMode::Attacher);
        assert_eq!(reader.len(), SHM_MIN_SIZE);
        let mut out = [0u8; 5];
        reader.read_bytes(100, &mut out).unwrap();
        assert_eq!(&out, b"frame");
        assert!(!reader.is_stale());

        // Writer restart replaces the object under the same name
        drop(writer);
        assert!(reader.is_stale());
        let _replacement = Segment::create(&name, SHM_MIN_SIZE).unwrap();
        assert!(reader.is_stale());
        let fresh = Segment::open(&name).unwrap().unwrap();
        assert!(!fresh.is_stale());
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let name = unique("range");
        let segment = Segment::create(&name, 64).unwrap();
        assert!(segment.write_bytes(60, &[0u8; 8]).is_err());
        let mut out = [0u8; 1];
        assert!(segment.read_bytes(usize::MAX, &mut out).is_err());
    }
}
