//! Session writer: one session buffer plus one stream per logical stream

use crate::controller::{StreamFault, StreamOptions};
use crate::error::{ShmError, ShmResult};
use crate::events::EventRegistry;
use crate::handle::WriteHandle;
use crate::session::SessionErrorFn;
use crate::session::buffer::{SessionBuffer, stream_segment_name};
use crate::stats::StreamStatsSnapshot;
use crate::writer::StreamWriter;
use framering::config::{SessionConfig, StreamConfig, TuningConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

struct WriterState {
    buffer: SessionBuffer,
    ids: Vec<Uuid>,
    streams: Vec<Arc<StreamWriter>>,
}

/// Writer side of a named session.
///
/// Any stream fault marks the whole session for regeneration: the next
/// [`query_write_buffer`](Self::query_write_buffer) creates fresh stream
/// segments under new ids, advertises them, then drops the old ones.
/// Readers notice the id change and reattach.
pub struct SessionWriter {
    name: String,
    configs: Vec<StreamConfig>,
    options: StreamOptions,
    state: Mutex<WriterState>,
    needs_regen: Arc<AtomicBool>,
    generation: AtomicU64,
    on_error: Arc<EventRegistry<SessionErrorFn>>,
}

impl SessionWriter {
    /// Create the session `name` with one stream per entry of `streams`
    pub fn new(name: &str, streams: &[StreamConfig], tuning: &TuningConfig) -> ShmResult<Self> {
        let config = SessionConfig {
            name: name.to_string(),
            log_level: Default::default(),
            streams: streams.to_vec(),
            tuning: *tuning,
        };
        Self::from_config(&config)
    }

    /// Create the session described by `config`
    pub fn from_config(config: &SessionConfig) -> ShmResult<Self> {
        config.validate()?;

        let needs_regen = Arc::new(AtomicBool::new(false));
        let on_error: Arc<EventRegistry<SessionErrorFn>> = Arc::new(EventRegistry::new());
        let options = StreamOptions::from(&config.tuning);

        let (ids, streams) = build_streams(
            &config.name,
            &config.streams,
            options,
            &needs_regen,
            &on_error,
        )?;
        let buffer = SessionBuffer::create(&config.name, &ids)?;

        Ok(Self {
            name: config.name.clone(),
            configs: config.streams.clone(),
            options,
            state: Mutex::new(WriterState {
                buffer,
                ids,
                streams,
            }),
            needs_regen,
            generation: AtomicU64::new(0),
            on_error,
        })
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of logical streams
    pub fn stream_count(&self) -> usize {
        self.configs.len()
    }

    /// Currently advertised stream ids
    pub fn stream_ids(&self) -> Vec<Uuid> {
        self.state.lock().ids.clone()
    }

    /// How many times the session has been regenerated
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Stream faults as `(stream_index, fault)`, raised on the writing thread
    pub fn on_error(&self) -> &EventRegistry<SessionErrorFn> {
        &self.on_error
    }

    /// Traffic counters of stream `index`
    pub fn stats(&self, index: usize) -> ShmResult<StreamStatsSnapshot> {
        Ok(self.stream(index)?.stats())
    }

    /// Acquire a slot of stream `index`; releasing the handle publishes it.
    ///
    /// A pending regeneration runs first.
    pub fn query_write_buffer(&self, index: usize) -> ShmResult<WriteHandle> {
        if self.needs_regen.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.regenerate() {
                self.needs_regen.store(true, Ordering::Release);
                tracing::error!("Failed to regenerate session {}: {}", self.name, e);
                return Err(e);
            }
        }
        self.stream(index)?.query_write_buffer()
    }

    /// Replace every stream with a freshly created one under a new id.
    ///
    /// New segments exist before their ids are advertised, and old segments
    /// are removed only afterwards, so readers never see an id without a
    /// segment behind it (other than during a torn read).
    pub fn regenerate(&self) -> ShmResult<()> {
        let (ids, streams) = build_streams(
            &self.name,
            &self.configs,
            self.options,
            &self.needs_regen,
            &self.on_error,
        )?;

        let retired = {
            let mut state = self.state.lock();
            if state.buffer.is_stale() {
                state.buffer = SessionBuffer::create(&self.name, &ids)?;
            } else {
                state.buffer.write_ids(&ids)?;
            }
            state.ids = ids;
            std::mem::replace(&mut state.streams, streams)
        };
        drop(retired);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!("Regenerated session {} (generation {})", self.name, generation);
        Ok(())
    }

    fn stream(&self, index: usize) -> ShmResult<Arc<StreamWriter>> {
        let state = self.state.lock();
        state
            .streams
            .get(index)
            .cloned()
            .ok_or(ShmError::StreamIndexOutOfRange {
                index,
                count: state.streams.len(),
            })
    }
}

fn build_streams(
    session: &str,
    configs: &[StreamConfig],
    options: StreamOptions,
    needs_regen: &Arc<AtomicBool>,
    on_error: &Arc<EventRegistry<SessionErrorFn>>,
) -> ShmResult<(Vec<Uuid>, Vec<Arc<StreamWriter>>)> {
    let mut ids = Vec::with_capacity(configs.len());
    let mut streams = Vec::with_capacity(configs.len());

    for (index, config) in configs.iter().enumerate() {
        let id = Uuid::new_v4();
        let writer = StreamWriter::create(&stream_segment_name(session, &id), *config, options)?;
        writer.set_self_heal(false);

        let needs_regen = Arc::clone(needs_regen);
        let on_error = Arc::clone(on_error);
        writer.on_error().subscribe(Arc::new(move |fault: StreamFault| {
            needs_regen.store(true, Ordering::Release);
            on_error.emit(|callback| callback(index, fault));
        }));

        ids.push(id);
        streams.push(Arc::new(writer));
    }
    Ok((ids, streams))
}

impl std::fmt::Debug for SessionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWriter")
            .field("name", &self.name)
            .field("streams", &self.configs)
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{get_current_pid, segment_path};
    use std::time::Duration;

    fn unique(tag: &str) -> String {
        format!("framering_sw_{}_{}", tag, get_current_pid())
    }

    #[test]
    fn test_creates_session_and_streams() {
        let name = unique("create");
        let writer = SessionWriter::new(
            &name,
            &[StreamConfig::new(2, 64), StreamConfig::new(3, 128)],
            &TuningConfig::default(),
        )
        .unwrap();

        let advertised = SessionBuffer::open(&name).unwrap().unwrap();
        assert_eq!(advertised.stream_ids().unwrap(), writer.stream_ids());
        for id in writer.stream_ids() {
            assert!(segment_path(&stream_segment_name(&name, &id)).exists());
        }

        writer.query_write_buffer(1).unwrap().release();
        assert_eq!(writer.stats(1).unwrap().published, 1);
        assert!(matches!(
            writer.query_write_buffer(2),
            Err(ShmError::StreamIndexOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_regenerate_replaces_ids_and_segments() {
        let name = unique("regen");
        let writer =
            SessionWriter::new(&name, &[StreamConfig::new(2, 64)], &TuningConfig::default())
                .unwrap();
        let old = writer.stream_ids();

        writer.regenerate().unwrap();
        let new = writer.stream_ids();
        assert_ne!(old, new);
        assert_eq!(writer.generation(), 1);

        let advertised = SessionBuffer::open(&name).unwrap().unwrap();
        assert_eq!(advertised.stream_ids().unwrap(), new);
        assert!(!segment_path(&stream_segment_name(&name, &old[0])).exists());
        assert!(segment_path(&stream_segment_name(&name, &new[0])).exists());
    }

    #[test]
    fn test_stream_fault_triggers_regeneration() {
        let name = unique("fault");
        let tuning = TuningConfig {
            grace_window_ms: 10,
            ..TuningConfig::default()
        };
        let writer = SessionWriter::new(&name, &[StreamConfig::new(1, 64)], &tuning).unwrap();
        let faults = Arc::new(Mutex::new(Vec::new()));
        {
            let faults = Arc::clone(&faults);
            writer
                .on_error()
                .subscribe(Arc::new(move |index: usize, fault: StreamFault| {
                    faults.lock().push((index, fault));
                }));
        }

        let _stuck = writer.query_write_buffer(0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(writer.query_write_buffer(0).is_err());
        assert_eq!(*faults.lock(), vec![(0, StreamFault::PoolStalled)]);

        assert!(writer.query_write_buffer(0).is_ok());
        assert_eq!(writer.generation(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            SessionWriter::new("", &[StreamConfig::new(1, 1)], &TuningConfig::default()),
            Err(ShmError::Config { .. })
        ));
        assert!(SessionWriter::new(&unique("none"), &[], &TuningConfig::default()).is_err());
    }
}
