//! Session discovery and cleanup

use crate::error::ShmResult;
use crate::platform::{segment_path, shm_root};
use crate::session::{SessionBuffer, stream_segment_name};
use crate::stream_buffer::StreamBuffer;
use framering::consts::{IDENTIFIER_LEN, SESSION_BUFFER_MAGIC};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Discovery service scanning the shm root for sessions
#[derive(Debug, Default)]
pub struct SessionDiscovery;

/// One advertised session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session name
    pub name: String,
    /// Advertised stream count
    pub stream_count: u32,
    /// Per-stream details, in index order
    pub streams: Vec<StreamInfo>,
}

/// One stream of an advertised session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream index within the session
    pub index: usize,
    /// Current stream id
    pub id: String,
    /// Segment name derived from the id
    pub segment: String,
    /// Whether the segment exists and holds an initialized stream buffer
    pub attached: bool,
    /// Slots, when attached
    pub pool_size: Option<u32>,
    /// Slot size in bytes, when attached
    pub slot_size: Option<u32>,
}

impl SessionDiscovery {
    /// Create new discovery service
    pub fn new() -> Self {
        Self
    }

    /// List every session under the shm root
    pub fn list_sessions(&self) -> ShmResult<Vec<SessionInfo>> {
        let root = shm_root();
        let mut sessions = Vec::new();

        for entry in std::fs::read_dir(&root)?.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !has_session_magic(&entry.path()) {
                continue;
            }
            if let Ok(Some(info)) = self.describe(&name) {
                sessions.push(info);
            }
        }

        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    /// Find session by name
    pub fn find_session(&self, name: &str) -> ShmResult<Option<SessionInfo>> {
        self.describe(name)
    }

    /// Remove a session and every stream it advertises.
    ///
    /// Used after a writer crashed without cleaning up. Returns the number of
    /// objects removed.
    pub fn purge_session(&self, name: &str) -> ShmResult<usize> {
        let Some(buffer) = SessionBuffer::open(name)? else {
            return Ok(0);
        };
        let mut removed = 0;
        for segment in buffer.stream_segment_names()? {
            if remove_if_present(&segment_path(&segment))? {
                removed += 1;
            }
        }
        drop(buffer);
        if remove_if_present(&segment_path(name))? {
            removed += 1;
        }

        tracing::info!("Purged session {} ({} objects)", name, removed);
        Ok(removed)
    }

    /// Render sessions as pretty JSON
    pub fn to_json(sessions: &[SessionInfo]) -> ShmResult<String> {
        Ok(serde_json::to_string_pretty(sessions)?)
    }

    fn describe(&self, name: &str) -> ShmResult<Option<SessionInfo>> {
        let Some(buffer) = SessionBuffer::open(name)? else {
            return Ok(None);
        };

        let streams = buffer
            .stream_ids()?
            .into_iter()
            .enumerate()
            .map(|(index, id)| {
                let segment = stream_segment_name(name, &id);
                let geometry = StreamBuffer::attach(&segment)
                    .ok()
                    .flatten()
                    .map(|b| (b.pool_size(), b.slot_size()));
                StreamInfo {
                    index,
                    id: id.to_string(),
                    segment,
                    attached: geometry.is_some(),
                    pool_size: geometry.map(|g| g.0),
                    slot_size: geometry.map(|g| g.1),
                }
            })
            .collect();

        Ok(Some(SessionInfo {
            name: name.to_string(),
            stream_count: buffer.stream_count(),
            streams,
        }))
    }
}

fn has_session_magic(path: &Path) -> bool {
    let mut identifier = [0u8; IDENTIFIER_LEN];
    std::fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut identifier))
        .is_ok()
        && identifier == SESSION_BUFFER_MAGIC
}

fn remove_if_present(path: &Path) -> ShmResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;
    use crate::session::SessionWriter;
    use framering::config::{StreamConfig, TuningConfig};

    fn unique(tag: &str) -> String {
        format!("framering_discovery_{}_{}", tag, get_current_pid())
    }

    #[test]
    fn test_list_and_find_session() {
        let name = unique("list");
        let writer = SessionWriter::new(
            &name,
            &[StreamConfig::new(2, 64), StreamConfig::new(4, 32)],
            &TuningConfig::default(),
        )
        .unwrap();
        let discovery = SessionDiscovery::new();

        let sessions = discovery.list_sessions().unwrap();
        let info = sessions.iter().find(|s| s.name == name).unwrap();
        assert_eq!(info.stream_count, 2);
        assert!(info.streams.iter().all(|s| s.attached));
        assert_eq!(info.streams[1].pool_size, Some(4));
        assert_eq!(info.streams[0].id, writer.stream_ids()[0].to_string());

        let found = discovery.find_session(&name).unwrap().unwrap();
        assert_eq!(&found, info);
        assert!(discovery.find_session(&unique("missing")).unwrap().is_none());

        let json = SessionDiscovery::to_json(&[found]).unwrap();
        assert!(json.contains(&name));
    }

    #[test]
    fn test_purge_removes_session_objects() {
        let name = unique("purge");
        let writer =
            SessionWriter::new(&name, &[StreamConfig::new(1, 64)], &TuningConfig::default())
                .unwrap();
        let stream = stream_segment_name(&name, &writer.stream_ids()[0]);

        // Simulate a crashed writer: its mappings are gone but the objects stay
        std::mem::forget(writer);
        let discovery = SessionDiscovery::new();
        assert_eq!(discovery.purge_session(&name).unwrap(), 2);
        assert!(!segment_path(&stream).exists());
        assert!(!segment_path(&name).exists());
        assert_eq!(discovery.purge_session(&name).unwrap(), 0);
    }
}
