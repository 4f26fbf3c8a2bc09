//! Session buffer: the discovery record of a session
//!
//! ```text
//! offset 0   [identifier: 16]
//! offset 16  [stream_count: u32]
//! offset 20  [stream id: 16] x stream_count
//! ```
//!
//! Stream ids are random v4 UUIDs. Stream `i` lives in the segment named
//! `<session>_<id i as 32 hex digits>`. The writer rewrites the ids in place
//! whenever it regenerates the session; a reader that catches a half-written
//! id derives a segment name that does not exist and simply retries later.

use crate::error::{ShmError, ShmResult};
use crate::segment::{Segment, page_aligned_size};
use framering::consts::{IDENTIFIER_LEN, SESSION_BUFFER_MAGIC, SHM_MAX_SIZE};
use uuid::Uuid;

const COUNT_OFFSET: usize = IDENTIFIER_LEN;
const IDS_OFFSET: usize = COUNT_OFFSET + 4;

/// Segment name of the stream identified by `id` within `session`
pub fn stream_segment_name(session: &str, id: &Uuid) -> String {
    format!("{}_{}", session, id.simple())
}

fn id_offset(index: usize) -> usize {
    IDS_OFFSET + index * IDENTIFIER_LEN
}

/// A mapped session buffer
#[derive(Debug)]
pub struct SessionBuffer {
    segment: Segment,
    stream_count: u32,
}

impl SessionBuffer {
    /// Create (or replace) the session segment `name` advertising `ids`
    pub fn create(name: &str, ids: &[Uuid]) -> ShmResult<Self> {
        if ids.is_empty() {
            return Err(ShmError::InvalidConfig {
                reason: "a session needs at least one stream".to_string(),
            });
        }
        let used = id_offset(ids.len());
        if used > SHM_MAX_SIZE {
            return Err(ShmError::InvalidSize { size: used });
        }

        let segment = Segment::create(name, page_aligned_size(used))?;
        let buffer = Self {
            segment,
            stream_count: ids.len() as u32,
        };
        buffer
            .segment
            .write_bytes(COUNT_OFFSET, &buffer.stream_count.to_ne_bytes())?;
        buffer.write_ids(ids)?;
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        buffer.segment.write_bytes(0, &SESSION_BUFFER_MAGIC)?;

        tracing::info!("Created session {} with {} streams", name, ids.len());
        Ok(buffer)
    }

    /// Attach to the session segment `name`; `Ok(None)` while it is absent
    pub fn open(name: &str) -> ShmResult<Option<Self>> {
        let Some(segment) = Segment::open(name)? else {
            return Ok(None);
        };
        let malformed = || ShmError::Malformed {
            name: name.to_string(),
        };

        if segment.len() < IDS_OFFSET {
            return Err(malformed());
        }
        let mut identifier = [0u8; IDENTIFIER_LEN];
        segment.read_bytes(0, &mut identifier)?;
        if identifier != SESSION_BUFFER_MAGIC {
            return Err(malformed());
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);

        let mut raw = [0u8; 4];
        segment.read_bytes(COUNT_OFFSET, &mut raw)?;
        let stream_count = u32::from_ne_bytes(raw);
        if stream_count == 0 || segment.len() < id_offset(stream_count as usize) {
            return Err(malformed());
        }

        Ok(Some(Self {
            segment,
            stream_count,
        }))
    }

    /// Session name
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Number of advertised streams, fixed at creation
    pub fn stream_count(&self) -> u32 {
        self.stream_count
    }

    /// Whether the session name now refers to another object (or none)
    pub fn is_stale(&self) -> bool {
        self.segment.is_stale()
    }

    /// Current id of stream `index`
    pub fn stream_id(&self, index: usize) -> ShmResult<Uuid> {
        if index >= self.stream_count as usize {
            return Err(ShmError::StreamIndexOutOfRange {
                index,
                count: self.stream_count as usize,
            });
        }
        let mut raw = [0u8; IDENTIFIER_LEN];
        self.segment.read_bytes(id_offset(index), &mut raw)?;
        Ok(Uuid::from_bytes(raw))
    }

    /// Current ids of every stream, in index order
    pub fn stream_ids(&self) -> ShmResult<Vec<Uuid>> {
        (0..self.stream_count as usize)
            .map(|index| self.stream_id(index))
            .collect()
    }

    /// Segment names of every stream, in index order
    pub fn stream_segment_names(&self) -> ShmResult<Vec<String>> {
        Ok(self
            .stream_ids()?
            .iter()
            .map(|id| stream_segment_name(self.name(), id))
            .collect())
    }

    /// Overwrite every stream id in place
    pub fn write_ids(&self, ids: &[Uuid]) -> ShmResult<()> {
        if ids.len() != self.stream_count as usize {
            return Err(ShmError::StreamCountMismatch {
                name: self.name().to_string(),
                expected: self.stream_count as usize,
                found: ids.len(),
            });
        }
        for (index, id) in ids.iter().enumerate() {
            self.segment.write_bytes(id_offset(index), id.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;

    fn unique(tag: &str) -> String {
        format!("framering_session_buffer_{}_{}", tag, get_current_pid())
    }

    #[test]
    fn test_stream_segment_name_format() {
        let id = Uuid::from_bytes([0xab; 16]);
        assert_eq!(
            stream_segment_name("rig", &id),
            format!("rig_{}", "ab".repeat(16))
        );
        assert_eq!(
            stream_segment_name("rig", &id).len(),
            "rig".len() + framering::config::STREAM_NAME_SUFFIX_LEN
        );
    }

    #[test]
    fn test_create_open_and_rewrite_ids() {
        let name = unique("ids");
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let writer = SessionBuffer::create(&name, &ids).unwrap();

        let reader = SessionBuffer::open(&name).unwrap().unwrap();
        assert_eq!(reader.stream_count(), 3);
        assert_eq!(reader.stream_ids().unwrap(), ids);

        let fresh = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        writer.write_ids(&fresh).unwrap();
        assert_eq!(reader.stream_ids().unwrap(), fresh);
        assert!(!reader.is_stale());

        assert!(matches!(
            writer.write_ids(&fresh[..2]),
            Err(ShmError::StreamCountMismatch { .. })
        ));
        assert!(matches!(
            reader.stream_id(3),
            Err(ShmError::StreamIndexOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_open_rejects_foreign_segment() {
        let name = unique("foreign");
        let _segment = Segment::create(&name, 4096).unwrap();
        assert!(matches!(
            SessionBuffer::open(&name),
            Err(ShmError::Malformed { .. })
        ));
        assert!(SessionBuffer::open(&unique("absent")).unwrap().is_none());
    }

    #[test]
    fn test_empty_session_rejected() {
        assert!(SessionBuffer::create(&unique("empty"), &[]).is_err());
    }
}
