//! Stand-in for the external tracing facility.
//!
//! The real engine lives outside this service; the daemon only supervises
//! sessions over its handle-based interface. This stub honors the handle
//! contract (strictly monotonic from 1) and returns empty buffers, so the
//! rest of the pipeline runs unchanged on hosts without a tracing backend.

use std::sync::atomic::{AtomicI64, Ordering};

use prefetch_core::session_tracker::{
    EngineState, Handle, StateChangedCallback, TraceBuffer, TraceEngine,
};
use tracing::debug;

pub struct StubTraceEngine {
    next_handle: AtomicI64,
}

impl StubTraceEngine {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicI64::new(1),
        }
    }
}

impl Default for StubTraceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceEngine for StubTraceEngine {
    fn create(&self, config: &[u8], _callback: StateChangedCallback) -> Handle {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        debug!(handle, config_len = config.len(), "Stub engine create");
        handle
    }

    fn start_tracing(&self, handle: Handle) {
        debug!(handle, "Stub engine start tracing");
    }

    fn read_trace(&self, handle: Handle) -> TraceBuffer {
        debug!(handle, "Stub engine read trace");
        TraceBuffer::new()
    }

    fn destroy(&self, handle: Handle) {
        debug!(handle, "Stub engine destroy");
    }

    fn poll_state(&self, _handle: Handle) -> EngineState {
        0
    }
}
