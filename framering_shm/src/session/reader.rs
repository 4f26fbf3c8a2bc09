//! Session reader: discovers a session's streams and follows writer restarts

use crate::controller::{StreamFault, StreamOptions};
use crate::error::{ShmError, ShmResult};
use crate::events::EventRegistry;
use crate::handle::ReadHandle;
use crate::reader::StreamReader;
use crate::session::buffer::{SessionBuffer, stream_segment_name};
use crate::session::{SessionBufferFn, SessionErrorFn};
use crate::stats::StreamStatsSnapshot;
use framering::config::{SessionConfig, TuningConfig, validate_session_name};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct AttachedStream {
    id: Uuid,
    reader: Arc<StreamReader>,
    // Set by the stream's fault subscription, honored by the next refresh
    needs_reattach: Arc<AtomicBool>,
}

#[derive(Default)]
struct ReaderState {
    buffer: Option<SessionBuffer>,
    streams: Vec<Option<AttachedStream>>,
}

struct Shared {
    name: String,
    expected_count: Option<usize>,
    options: StreamOptions,
    wait_timeout: Duration,
    discovery_interval: Duration,
    state: Mutex<ReaderState>,
    refresh_lock: Mutex<()>,
    on_buffer: Arc<EventRegistry<SessionBufferFn>>,
    on_error: Arc<EventRegistry<SessionErrorFn>>,
    running: AtomicBool,
}

/// Reader side of a named session.
///
/// Creating a reader never fails because the session is missing: it
/// attaches whatever is advertised on each discovery pass and produces no
/// buffers until then. A changed stream id means the writer recreated that
/// stream; the old stream reader is stopped before the new one attaches.
///
/// A stream fault makes the next discovery pass remap that stream's
/// segment, so a reader stuck on a dead mapping recovers even when the
/// writer kept the same id.
///
/// While started, a discovery thread named `framering-session-<name>`
/// repeats [`refresh`](Self::refresh) every discovery interval, and one
/// delivery thread runs per attached stream. Subscribers may call back into
/// the session reader.
pub struct SessionReader {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionReader {
    /// Reader for session `name`.
    ///
    /// With `expected_count`, a session advertising another number of
    /// streams is rejected on refresh with
    /// [`ShmError::StreamCountMismatch`].
    pub fn new(
        name: &str,
        expected_count: Option<usize>,
        tuning: &TuningConfig,
    ) -> ShmResult<Self> {
        validate_session_name(name)?;
        tuning.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                expected_count,
                options: StreamOptions::from(tuning),
                wait_timeout: tuning.reader_wait_timeout(),
                discovery_interval: tuning.discovery_interval(),
                state: Mutex::new(ReaderState::default()),
                refresh_lock: Mutex::new(()),
                on_buffer: Arc::new(EventRegistry::new()),
                on_error: Arc::new(EventRegistry::new()),
                running: AtomicBool::new(false),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Reader expecting exactly the streams listed in `config`
    pub fn from_config(config: &SessionConfig) -> ShmResult<Self> {
        config.validate()?;
        Self::new(&config.name, Some(config.streams.len()), &config.tuning)
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Buffers of every stream as `(stream_index, handle)`, raised on that
    /// stream's delivery thread
    pub fn on_buffer(&self) -> &EventRegistry<SessionBufferFn> {
        &self.shared.on_buffer
    }

    /// Stream faults as `(stream_index, fault)`, raised on that stream's
    /// delivery thread
    pub fn on_error(&self) -> &EventRegistry<SessionErrorFn> {
        &self.shared.on_error
    }

    /// Number of streams currently attached
    pub fn attached_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .streams
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Ids of the attached streams, `None` where a stream is not attached
    pub fn stream_ids(&self) -> Vec<Option<Uuid>> {
        self.shared
            .state
            .lock()
            .streams
            .iter()
            .map(|s| s.as_ref().map(|s| s.id))
            .collect()
    }

    /// Traffic counters of attached stream `index`
    pub fn stats(&self, index: usize) -> Option<StreamStatsSnapshot> {
        self.shared
            .state
            .lock()
            .streams
            .get(index)
            .and_then(|s| s.as_ref().map(|s| s.reader.stats()))
    }

    /// Whether delivery and discovery threads are running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Run one discovery pass and return the number of attached streams
    pub fn refresh(&self) -> ShmResult<usize> {
        self.shared.refresh()
    }

    /// Attach what is available and start delivering.
    ///
    /// A missing session is not an error; the discovery thread keeps
    /// looking for it.
    pub fn start(&self) -> ShmResult<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(ShmError::AlreadyRunning {
                what: format!("session reader {}", self.name()),
            });
        }

        if let Err(e) = self.shared.refresh() {
            tracing::warn!("Initial discovery of {} failed: {}", self.name(), e);
        }
        for reader in self.shared.readers() {
            if !reader.is_running() {
                reader.start()?;
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("framering-session-{}", self.name()))
            .spawn(move || discovery_loop(&shared));
        match spawned {
            Ok(handle) => {
                *self.monitor.lock() = Some(handle);
                tracing::info!("Started session reader {}", self.name());
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e.into())
            }
        }
    }

    /// Stop discovery and every delivery thread; attached streams are kept
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            if handle.join().is_err() {
                tracing::error!("Discovery thread of {} panicked", self.name());
            }
        }
        // Joined without the state lock: subscribers on these threads may
        // be waiting for it.
        for reader in self.shared.readers() {
            reader.stop();
        }
    }
}

impl Shared {
    fn readers(&self) -> Vec<Arc<StreamReader>> {
        self.state
            .lock()
            .streams
            .iter()
            .flatten()
            .map(|s| Arc::clone(&s.reader))
            .collect()
    }

    fn refresh(&self) -> ShmResult<usize> {
        let _serial = self.refresh_lock.lock();

        let ids = {
            let mut state = self.state.lock();
            let reopen = state.buffer.as_ref().is_none_or(SessionBuffer::is_stale);
            if reopen {
                state.buffer = match SessionBuffer::open(&self.name) {
                    Ok(buffer) => buffer,
                    Err(e) if e.is_transient() => {
                        tracing::debug!("Session {} not ready: {}", self.name, e);
                        None
                    }
                    Err(e) => return Err(e),
                };
            }
            let Some(buffer) = state.buffer.as_ref() else {
                return Ok(attached(&state));
            };

            let count = buffer.stream_count() as usize;
            match self.expected_count {
                Some(expected) if expected != count => {
                    return Err(ShmError::StreamCountMismatch {
                        name: self.name.clone(),
                        expected,
                        found: count,
                    });
                }
                _ => {}
            }
            buffer.stream_ids()?
        };

        // Streams whose id changed or whose segment went away are detached
        // first, outside the state lock: stopping joins their threads.
        let retired: Vec<AttachedStream> = {
            let mut state = self.state.lock();
            let mut retired = Vec::new();
            if state.streams.len() != ids.len() {
                retired.extend(state.streams.drain(..).flatten());
                state.streams.resize_with(ids.len(), || None);
            }
            for (slot, id) in state.streams.iter_mut().zip(&ids) {
                let keep = slot
                    .as_ref()
                    .is_some_and(|s| s.id == *id && !s.reader.controller().is_stale());
                if !keep {
                    retired.extend(slot.take());
                }
            }
            retired
        };
        for old in retired {
            tracing::info!("Stream {} of {} changed, detaching", old.id, self.name);
            old.reader.stop();
        }

        let faulted: Vec<(usize, Arc<StreamReader>)> = self
            .state
            .lock()
            .streams
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref()
                    .filter(|s| s.needs_reattach.swap(false, Ordering::AcqRel))
                    .map(|s| (index, Arc::clone(&s.reader)))
            })
            .collect();
        for (index, reader) in faulted {
            match reader.controller().remap() {
                Ok(()) => tracing::warn!("Remapped faulted stream {} of {}", index, self.name),
                Err(e) => {
                    tracing::debug!("Remap of stream {} of {} pending: {}", index, self.name, e)
                }
            }
        }

        for (index, id) in ids.iter().enumerate() {
            if self.state.lock().streams[index].is_some() {
                continue;
            }
            let Some(stream) = self.attach_stream(index, id)? else {
                continue;
            };
            self.state.lock().streams[index] = Some(stream);
        }

        Ok(attached(&self.state.lock()))
    }

    fn attach_stream(&self, index: usize, id: &Uuid) -> ShmResult<Option<AttachedStream>> {
        let segment = stream_segment_name(&self.name, id);
        let reader = match StreamReader::attach(&segment, self.options, self.wait_timeout) {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                tracing::debug!("Stream {} of {} not mapped yet", index, self.name);
                return Ok(None);
            }
            Err(e) if e.is_transient() => {
                tracing::debug!("Stream {} of {} not ready: {}", index, self.name, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let on_buffer = Arc::clone(&self.on_buffer);
        reader
            .on_buffer()
            .subscribe(Arc::new(move |handle: &ReadHandle| {
                on_buffer.emit(|callback| callback(index, handle));
            }));
        let needs_reattach = Arc::new(AtomicBool::new(false));
        let on_error = Arc::clone(&self.on_error);
        {
            let needs_reattach = Arc::clone(&needs_reattach);
            reader
                .on_error()
                .subscribe(Arc::new(move |fault: StreamFault| {
                    needs_reattach.store(true, Ordering::Release);
                    on_error.emit(|callback| callback(index, fault));
                }));
        }

        if self.running.load(Ordering::Acquire) {
            reader.start()?;
        }
        tracing::info!("Attached stream {} of {} ({})", index, self.name, id);
        Ok(Some(AttachedStream {
            id: *id,
            reader: Arc::new(reader),
            needs_reattach,
        }))
    }
}

fn attached(state: &ReaderState) -> usize {
    state.streams.iter().filter(|s| s.is_some()).count()
}

fn discovery_loop(shared: &Shared) {
    let slice = shared.options.poll_slice;

    while shared.running.load(Ordering::Acquire) {
        let deadline = Instant::now() + shared.discovery_interval;
        while shared.running.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        match shared.refresh() {
            Ok(_) => {}
            Err(e) if e.is_transient() => tracing::debug!("Discovery of {}: {}", shared.name, e),
            Err(e) => tracing::warn!("Discovery of {} failed: {}", shared.name, e),
        }
    }
}

impl Drop for SessionReader {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SessionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReader")
            .field("name", &self.shared.name)
            .field("expected_count", &self.shared.expected_count)
            .field("attached", &self.attached_count())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;
    use crate::session::SessionWriter;
    use framering::config::StreamConfig;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn unique(tag: &str) -> String {
        format!("framering_sr_{}_{}", tag, get_current_pid())
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn fast_tuning() -> TuningConfig {
        TuningConfig {
            reader_wait_timeout_ms: 10,
            discovery_interval_ms: 10,
            ..TuningConfig::default()
        }
    }

    #[test]
    fn test_refresh_without_session_attaches_nothing() {
        let reader = SessionReader::new(&unique("absent"), None, &TuningConfig::default()).unwrap();
        assert_eq!(reader.refresh().unwrap(), 0);
        assert_eq!(reader.attached_count(), 0);
    }

    #[test]
    fn test_refresh_attaches_every_stream() {
        let name = unique("attach");
        let writer = SessionWriter::new(
            &name,
            &[StreamConfig::new(2, 64), StreamConfig::new(2, 64)],
            &TuningConfig::default(),
        )
        .unwrap();
        let reader = SessionReader::new(&name, Some(2), &TuningConfig::default()).unwrap();

        assert_eq!(reader.refresh().unwrap(), 2);
        let ids: Vec<_> = reader.stream_ids().into_iter().flatten().collect();
        assert_eq!(ids, writer.stream_ids());
    }

    #[test]
    fn test_expected_count_mismatch() {
        let name = unique("mismatch");
        let _writer =
            SessionWriter::new(&name, &[StreamConfig::new(2, 64)], &TuningConfig::default())
                .unwrap();
        let reader = SessionReader::new(&name, Some(3), &TuningConfig::default()).unwrap();

        assert!(matches!(
            reader.refresh(),
            Err(ShmError::StreamCountMismatch {
                expected: 3,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_refresh_follows_regenerated_ids() {
        let name = unique("follow");
        let writer =
            SessionWriter::new(&name, &[StreamConfig::new(2, 64)], &TuningConfig::default())
                .unwrap();
        let reader = SessionReader::new(&name, None, &TuningConfig::default()).unwrap();
        reader.refresh().unwrap();

        writer.regenerate().unwrap();
        assert_eq!(reader.refresh().unwrap(), 1);
        assert_eq!(reader.stream_ids(), vec![Some(writer.stream_ids()[0])]);
    }

    #[test]
    fn test_start_twice_fails() {
        let reader = SessionReader::new(&unique("twice"), None, &TuningConfig::default()).unwrap();
        reader.start().unwrap();
        assert!(matches!(reader.start(), Err(ShmError::AlreadyRunning { .. })));
        reader.stop();
        assert!(!reader.is_running());
    }

    #[test]
    fn test_stop_while_subscriber_queries_reader() {
        let name = unique("stop_query");
        let writer =
            SessionWriter::new(&name, &[StreamConfig::new(4, 64)], &fast_tuning()).unwrap();
        let reader = Arc::new(SessionReader::new(&name, Some(1), &fast_tuning()).unwrap());
        let delivered = Arc::new(AtomicUsize::new(0));
        {
            let weak = Arc::downgrade(&reader);
            let delivered = Arc::clone(&delivered);
            reader
                .on_buffer()
                .subscribe(Arc::new(move |_: usize, _: &ReadHandle| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    if let Some(reader) = weak.upgrade() {
                        reader.attached_count();
                    }
                }));
        }
        reader.start().unwrap();

        let publishing = AtomicBool::new(true);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                while publishing.load(Ordering::Acquire) {
                    if let Ok(handle) = writer.query_write_buffer(0) {
                        handle.release();
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            });

            assert!(wait_until(Duration::from_secs(2), || {
                delivered.load(Ordering::SeqCst) > 0
            }));
            let (done, stopped) = mpsc::channel();
            let stopping = Arc::clone(&reader);
            std::thread::spawn(move || {
                stopping.stop();
                let _ = done.send(());
            });
            let result = stopped.recv_timeout(Duration::from_secs(3));
            publishing.store(false, Ordering::Release);
            assert!(result.is_ok(), "stop did not return");
        });
        assert!(!reader.is_running());
    }

    #[test]
    fn test_stream_fault_remaps_stream() {
        let name = unique("fault_remap");
        let tuning = TuningConfig {
            grace_window_ms: 30,
            ..fast_tuning()
        };
        let writer = SessionWriter::new(&name, &[StreamConfig::new(2, 64)], &tuning).unwrap();
        let reader = SessionReader::new(&name, Some(1), &tuning).unwrap();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let delivered = Arc::new(AtomicUsize::new(0));
        {
            let faults = Arc::clone(&faults);
            reader
                .on_error()
                .subscribe(Arc::new(move |index: usize, fault: StreamFault| {
                    faults.lock().push((index, fault));
                }));
            let delivered = Arc::clone(&delivered);
            reader
                .on_buffer()
                .subscribe(Arc::new(move |_: usize, _: &ReadHandle| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }));
        }
        reader.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || reader.attached_count() == 1));

        // Nothing is published, so the stream stalls and gets remapped
        assert!(wait_until(Duration::from_secs(2), || {
            reader.stats(0).is_some_and(|s| s.remaps > 0)
        }));
        assert!(faults.lock().contains(&(0, StreamFault::ReaderStalled)));
        assert_eq!(reader.stream_ids(), vec![Some(writer.stream_ids()[0])]);

        assert!(wait_until(Duration::from_secs(2), || {
            if let Ok(handle) = writer.query_write_buffer(0) {
                handle.release();
            }
            delivered.load(Ordering::SeqCst) > 0
        }));
        reader.stop();
    }
}
