//! Synchronous stream writer

use crate::controller::{FaultCallback, StreamController, StreamFault, StreamOptions};
use crate::error::ShmResult;
use crate::events::EventRegistry;
use crate::handle::WriteHandle;
use crate::stats::StreamStatsSnapshot;
use framering::config::StreamConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Subscriber to stream faults
pub type StreamErrorFn = dyn Fn(StreamFault) + Send + Sync;

/// Writer side of one stream.
///
/// Runs entirely on the caller's thread, typically once per produced frame.
/// Faults are raised on the `on_error` event from the thread that queried or
/// released the handle. With self-healing enabled (the default) a fault also
/// makes the next [`query_write_buffer`](Self::query_write_buffer) recreate
/// the segment first.
pub struct StreamWriter {
    controller: StreamController,
    on_error: Arc<EventRegistry<StreamErrorFn>>,
    fault: FaultCallback,
    needs_remap: Arc<AtomicBool>,
    self_heal: AtomicBool,
}

impl StreamWriter {
    /// Create the stream segment `name`
    pub fn create(name: &str, config: StreamConfig, options: StreamOptions) -> ShmResult<Self> {
        Ok(Self::from_controller(StreamController::create(
            name, config, options,
        )?))
    }

    /// Wrap an existing writer-side controller
    pub fn from_controller(controller: StreamController) -> Self {
        let on_error: Arc<EventRegistry<StreamErrorFn>> = Arc::new(EventRegistry::new());
        let needs_remap = Arc::new(AtomicBool::new(false));

        let fault: FaultCallback = {
            let on_error = Arc::clone(&on_error);
            let needs_remap = Arc::clone(&needs_remap);
            Arc::new(move |fault: StreamFault| {
                needs_remap.store(true, Ordering::Release);
                on_error.emit(|callback| callback(fault));
            })
        };

        Self {
            controller,
            on_error,
            fault,
            needs_remap,
            self_heal: AtomicBool::new(true),
        }
    }

    /// Enable or disable recreating the segment after a fault.
    ///
    /// Sessions disable it and regenerate every stream instead.
    pub fn set_self_heal(&self, enabled: bool) {
        self.self_heal.store(enabled, Ordering::Release);
    }

    /// Acquire a slot to fill; releasing the handle publishes it.
    ///
    /// Fails with [`ShmError::PoolExhausted`](crate::ShmError::PoolExhausted)
    /// when every slot is busy: the frame is dropped.
    pub fn query_write_buffer(&self) -> ShmResult<WriteHandle> {
        if self.self_heal.load(Ordering::Acquire) && self.needs_remap.swap(false, Ordering::AcqRel)
        {
            if let Err(e) = self.controller.remap() {
                self.needs_remap.store(true, Ordering::Release);
                tracing::error!("Failed to recreate stream {}: {}", self.controller.name(), e);
                return Err(e);
            }
        }
        self.controller.query_write_buffer(&self.fault)
    }

    /// Fault event
    pub fn on_error(&self) -> &EventRegistry<StreamErrorFn> {
        &self.on_error
    }

    /// Recreate the segment now
    pub fn remap(&self) -> ShmResult<()> {
        self.needs_remap.store(false, Ordering::Release);
        self.controller.remap()
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
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("controller", &self.controller)
            .field("subscribers", &self.on_error.len())
            .finish()
    }
}
