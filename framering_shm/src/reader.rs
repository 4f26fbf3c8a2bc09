//! Stream reader with a background delivery thread

use crate::controller::{StreamController, StreamFault, StreamOptions};
use crate::error::{ShmError, ShmResult};
use crate::events::EventRegistry;
use crate::handle::ReadHandle;
use crate::stats::StreamStatsSnapshot;
use crate::writer::StreamErrorFn;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Subscriber to buffer-ready events.
///
/// The handle is released by the reader thread once every subscriber has
/// returned, so subscribers must not stall: while they run, the slot stays
/// share-locked and unavailable to the writer. A panicking subscriber is
/// logged and delivery continues.
pub type BufferFn = dyn Fn(&ReadHandle) + Send + Sync;

/// Reader side of one stream.
///
/// `start` spawns a thread named `framering-<segment>` that waits for each
/// publication and raises `on_buffer` with a zero-copy handle. Both events
/// fire on that thread. If nothing arrives for a whole grace window,
/// `on_error` receives [`StreamFault::ReaderStalled`] (once per window) and
/// the thread keeps waiting. When the writer replaced the segment, the
/// thread reattaches on its own.
pub struct StreamReader {
    controller: Arc<StreamController>,
    on_buffer: Arc<EventRegistry<BufferFn>>,
    on_error: Arc<EventRegistry<StreamErrorFn>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    wait_timeout: Duration,
}

impl StreamReader {
    /// Wrap a reader-side controller; `wait_timeout` bounds each wait cycle
    pub fn new(controller: StreamController, wait_timeout: Duration) -> Self {
        Self {
            controller: Arc::new(controller),
            on_buffer: Arc::new(EventRegistry::new()),
            on_error: Arc::new(EventRegistry::new()),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            wait_timeout,
        }
    }

    /// Attach to the stream segment `name`; `Ok(None)` while it is absent
    pub fn attach(
        name: &str,
        options: StreamOptions,
        wait_timeout: Duration,
    ) -> ShmResult<Option<Self>> {
        Ok(StreamController::attach(name, options)?
            .map(|controller| Self::new(controller, wait_timeout)))
    }

    /// Buffer-ready event
    pub fn on_buffer(&self) -> &EventRegistry<BufferFn> {
        &self.on_buffer
    }

    /// Fault event
    pub fn on_error(&self) -> &EventRegistry<StreamErrorFn> {
        &self.on_error
    }

    /// Underlying controller
    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    /// Segment name
    pub fn name(&self) -> &str {
        self.controller.name()
    }

    /// Traffic counters
    pub fn stats(&self) -> StreamStatsSnapshot {
        self.controller.stats().snapshot()
    }

    /// Whether the delivery thread is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the delivery thread
    pub fn start(&self) -> ShmResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ShmError::AlreadyRunning {
                what: format!("stream reader {}", self.name()),
            });
        }

        let controller = Arc::clone(&self.controller);
        let on_buffer = Arc::clone(&self.on_buffer);
        let on_error = Arc::clone(&self.on_error);
        let running = Arc::clone(&self.running);
        let wait_timeout = self.wait_timeout;

        let spawned = std::thread::Builder::new()
            .name(format!("framering-{}", self.name()))
            .spawn(move || {
                read_loop(&controller, &on_buffer, &on_error, &running, wait_timeout);
            });

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                tracing::info!("Started reader for {}", self.name());
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Stop the delivery thread and wait for it.
    ///
    /// Returns within one polling slice of the blocked wait. Calling it from
    /// a subscriber (on the delivery thread itself) only signals the stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Reader thread for {} panicked", self.name());
        } else {
            tracing::debug!("Stopped reader for {}", self.name());
        }
    }
}

fn read_loop(
    controller: &StreamController,
    on_buffer: &EventRegistry<BufferFn>,
    on_error: &EventRegistry<StreamErrorFn>,
    running: &AtomicBool,
    wait_timeout: Duration,
) {
    let grace_window = controller.options().grace_window;
    let mut last_delivery = Instant::now();

    while running.load(Ordering::Acquire) {
        let keep_waiting = || running.load(Ordering::Acquire);
        if let Some(handle) = controller.query_read_buffer(keep_waiting, wait_timeout) {
            last_delivery = Instant::now();
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                on_buffer.emit(|callback| callback(&handle))
            }));
            handle.release();
            if delivered.is_err() {
                tracing::error!("Buffer subscriber of {} panicked", controller.name());
            }
            continue;
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        if controller.is_stale() {
            match controller.remap() {
                Ok(()) => tracing::info!("Reattached to {}", controller.name()),
                Err(e) => tracing::debug!("Reattach to {} pending: {}", controller.name(), e),
            }
        }

        if last_delivery.elapsed() >= grace_window {
            last_delivery = Instant::now();
            controller.stats().record_fault();
            tracing::warn!(
                "No publication on {} for {:?}",
                controller.name(),
                grace_window
            );
            let raised = std::panic::catch_unwind(AssertUnwindSafe(|| {
                on_error.emit(|callback| callback(StreamFault::ReaderStalled))
            }));
            if raised.is_err() {
                tracing::error!("Fault subscriber of {} panicked", controller.name());
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("controller", &self.controller)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;
    use crate::writer::StreamWriter;
    use framering::config::StreamConfig;
    use std::sync::atomic::AtomicUsize;

    fn unique(tag: &str) -> String {
        format!("framering_reader_{}_{}", tag, get_current_pid())
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

    #[test]
    fn test_delivers_published_buffers() {
        let name = unique("deliver");
        let writer =
            StreamWriter::create(&name, StreamConfig::new(4, 64), StreamOptions::default())
                .unwrap();
        let reader = StreamReader::attach(&name, StreamOptions::default(), Duration::from_millis(50))
            .unwrap()
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = Arc::clone(&received);
            reader.on_buffer().subscribe(Arc::new(move |handle: &ReadHandle| {
                received.lock().push(handle.as_slice()[0]);
            }));
        }
        reader.start().unwrap();
        assert!(matches!(reader.start(), Err(ShmError::AlreadyRunning { .. })));

        let mut handle = writer.query_write_buffer().unwrap();
        handle.copy_from(&[42]);
        handle.release();

        assert!(wait_until(Duration::from_secs(2), || !received.lock().is_empty()));
        assert_eq!(received.lock()[0], 42);
        reader.stop();
        assert!(!reader.is_running());
    }

    #[test]
    fn test_stop_is_bounded() {
        let name = unique("stop");
        let _writer =
            StreamWriter::create(&name, StreamConfig::new(2, 64), StreamOptions::default())
                .unwrap();
        let reader = StreamReader::attach(&name, StreamOptions::default(), Duration::from_secs(10))
            .unwrap()
            .unwrap();
        reader.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        reader.stop();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_stalled_reader_raises_fault() {
        let name = unique("stalled");
        let options = StreamOptions {
            grace_window: Duration::from_millis(40),
            ..StreamOptions::default()
        };
        let _writer = StreamWriter::create(&name, StreamConfig::new(2, 64), options).unwrap();
        let reader = StreamReader::attach(&name, options, Duration::from_millis(20))
            .unwrap()
            .unwrap();

        let faults = Arc::new(AtomicUsize::new(0));
        {
            let faults = Arc::clone(&faults);
            reader.on_error().subscribe(Arc::new(move |fault: StreamFault| {
                assert_eq!(fault, StreamFault::ReaderStalled);
                faults.fetch_add(1, Ordering::SeqCst);
            }));
        }
        reader.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            faults.load(Ordering::SeqCst) > 0
        }));
        reader.stop();
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let name = unique("panic");
        let writer =
            StreamWriter::create(&name, StreamConfig::new(2, 64), StreamOptions::default())
                .unwrap();
        let reader = StreamReader::attach(&name, StreamOptions::default(), Duration::from_millis(20))
            .unwrap()
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            reader.on_buffer().subscribe(Arc::new(move |_: &ReadHandle| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first frame rejected");
                }
            }));
        }
        reader.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            if let Ok(handle) = writer.query_write_buffer() {
                handle.release();
            }
            seen.load(Ordering::SeqCst) >= 2
        }));
        assert!(reader.is_running());
        reader.stop();

        // The slot of the panicking delivery was released too
        let buffer = writer.controller().current();
        assert!(
            buffer
                .handlers()
                .iter()
                .all(|h| h.state() == crate::sync::LockState::Free)
        );
    }

    #[test]
    fn test_reattaches_after_writer_remap() {
        let name = unique("reattach");
        let writer =
            StreamWriter::create(&name, StreamConfig::new(2, 64), StreamOptions::default())
                .unwrap();
        let reader = StreamReader::attach(&name, StreamOptions::default(), Duration::from_millis(20))
            .unwrap()
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            reader.on_buffer().subscribe(Arc::new(move |_: &ReadHandle| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        reader.start().unwrap();

        writer.remap().unwrap();
        assert!(wait_until(Duration::from_secs(2), || !reader.controller().is_stale()));

        writer.query_write_buffer().unwrap().release();
        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) > 0
        }));
        reader.stop();
    }
}
