//! Typed lifecycle tracking over the raw tracing engine.
//!
//! The engine's handle-based API is unforgiving: double-destroy,
//! use-after-destroy, and leaked sessions are all silent. This module wraps
//! it with a state machine keyed by handle so higher layers reason about
//! sessions by kind, and reconstructs destroyed/uncreated classifications
//! for untracked handles from the engine's strictly monotonic handle
//! counter.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::dump::Printer;

/// Opaque session identifier issued by the tracing engine.
///
/// Handles start at 1 and increment by one per `create`; the tracker aborts
/// if the engine ever violates that, because the untracked-handle classifier
/// depends on it.
pub type Handle = i64;

pub const INVALID_HANDLE: Handle = 0;

/// Raw engine state, recorded verbatim for dumps.
pub type EngineState = i32;

/// Trace bytes handed to the caller; the tracker keeps no reference.
pub type TraceBuffer = Vec<u8>;

pub type StateChangedCallback = Box<dyn Fn(Handle, EngineState) + Send + Sync>;

/// The external tracing facility, at its interface.
pub trait TraceEngine: Send + Sync {
    fn create(&self, config: &[u8], callback: StateChangedCallback) -> Handle;
    fn start_tracing(&self, handle: Handle);
    fn read_trace(&self, handle: Handle) -> TraceBuffer;
    fn destroy(&self, handle: Handle);
    fn poll_state(&self, handle: Handle) -> EngineState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Uncreated,
    Created,
    StartedTracing,
    ReadTracing,
    Destroyed,
    TimedOutDestroyed,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Uncreated => "uncreated",
            HandleKind::Created => "created",
            HandleKind::StartedTracing => "started_tracing",
            HandleKind::ReadTracing => "read_tracing",
            HandleKind::Destroyed => "destroyed",
            HandleKind::TimedOutDestroyed => "timed_out_destroyed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            HandleKind::Uncreated => 0,
            HandleKind::Created => 1,
            HandleKind::StartedTracing => 2,
            HandleKind::ReadTracing => 3,
            HandleKind::Destroyed | HandleKind::TimedOutDestroyed => 4,
        }
    }

    /// Legal transition edges: strictly forward along
    /// Uncreated → Created → StartedTracing → ReadTracing → Destroyed, with
    /// the three live kinds also permitted to jump to TimedOutDestroyed.
    pub fn can_transition(from: HandleKind, to: HandleKind) -> bool {
        if to == HandleKind::TimedOutDestroyed {
            return matches!(
                from,
                HandleKind::Created | HandleKind::StartedTracing | HandleKind::ReadTracing
            );
        }
        to.rank() > from.rank()
    }
}

#[derive(Debug, Clone)]
pub struct HandleDescription {
    pub handle: Handle,
    pub kind: HandleKind,
    pub engine_state: EngineState,
    pub started_tracing_ns: Option<u64>,
    pub last_transition_ns: u64,
}

impl HandleDescription {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            kind: HandleKind::Uncreated,
            engine_state: 0,
            started_tracing_ns: None,
            last_transition_ns: 0,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    states: BTreeMap<Handle, HandleDescription>,
    last_created: Handle,
    last_destroyed: Handle,
}

pub struct SessionTracker {
    engine: Box<dyn TraceEngine>,
    state: Mutex<TrackerState>,
}

impl SessionTracker {
    pub fn new(engine: Box<dyn TraceEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Allocates a new tracing session. This is the sole path that inserts
    /// into the tracked map.
    ///
    /// Panics if the engine hands out a non-monotonic or re-used handle;
    /// the untracked-handle classifier is built on that contract and a
    /// violation must be loud.
    pub fn create(&self, config: &[u8], callback: StateChangedCallback) -> Handle {
        debug!(config_len = config.len(), "SessionTracker::create");
        let handle = self.engine.create(config, callback);

        let mut state = self.lock_state();
        state.last_created += 1;
        assert_eq!(
            state.last_created, handle,
            "tracing engine handle had unexpected behavior"
        );
        assert!(
            !state.states.contains_key(&handle),
            "tracing engine re-used handle {}",
            handle
        );

        let mut desc = HandleDescription::new(handle);
        self.update_description(&mut desc, HandleKind::Created);
        state.states.insert(handle, desc);

        handle
    }

    pub fn start_tracing(&self, handle: Handle) {
        debug!(handle, "SessionTracker::start_tracing");
        let mut state = self.lock_state();

        let desc = match state.states.get_mut(&handle) {
            Some(desc) => desc,
            None => {
                error!(handle, "Cannot start tracing, untracked handle");
                return;
            }
        };

        self.engine.start_tracing(handle);
        self.update_description(desc, HandleKind::StartedTracing);
    }

    /// Reads the session's trace buffer, handing ownership to the caller.
    /// An untracked handle yields an empty buffer.
    pub fn read_trace(&self, handle: Handle) -> TraceBuffer {
        debug!(handle, "SessionTracker::read_trace");
        let mut state = self.lock_state();

        if !state.states.contains_key(&handle) {
            error!(handle, "Cannot read trace, untracked handle");
            return TraceBuffer::new();
        }

        let buffer = self.engine.read_trace(handle);
        if let Some(desc) = state.states.get_mut(&handle) {
            self.update_description(desc, HandleKind::ReadTracing);
        }
        buffer
    }

    /// Destroys a session and stops tracking it. Calling this on an
    /// untracked handle is a logged no-op so it stays idempotent against
    /// timeout/user races.
    pub fn destroy(&self, handle: Handle) {
        self.destroy_with_kind(handle, HandleKind::Destroyed);
    }

    /// Supervisor-triggered forced destroy for sessions whose read never
    /// arrived. Indistinguishable from `destroy` except for the kind
    /// recorded on the way out, which dumps and logs preserve.
    pub fn destroy_timed_out(&self, handle: Handle) {
        self.destroy_with_kind(handle, HandleKind::TimedOutDestroyed);
    }

    fn destroy_with_kind(&self, handle: Handle, kind: HandleKind) {
        debug!(handle, kind = kind.as_str(), "SessionTracker::destroy");
        let mut state = self.lock_state();

        let mut desc = match state.states.remove(&handle) {
            Some(desc) => desc,
            None => {
                // Leniency for calling destroy multiple times. It's not a mistake.
                warn!(handle, "Cannot destroy, untracked handle");
                return;
            }
        };

        self.engine.destroy(handle);
        self.update_description(&mut desc, kind);
        state.last_destroyed = handle;
    }

    pub fn poll_state(&self, handle: Handle) -> EngineState {
        // Pass-through; the tracker never interprets the engine state.
        self.engine.poll_state(handle)
    }

    /// Fetches the tracked record, or infers one for an untracked handle:
    /// destroyed when the handle is at or below the destruction watermark,
    /// uncreated when above the creation watermark. Diagnostic only.
    pub fn get_or_infer_handle_description(&self, handle: Handle) -> HandleDescription {
        let state = self.lock_state();

        if let Some(desc) = state.states.get(&handle) {
            return desc.clone();
        }

        let mut desc = HandleDescription::new(handle);
        if handle != INVALID_HANDLE && handle <= state.last_destroyed {
            desc.kind = HandleKind::Destroyed;
        } else if handle == INVALID_HANDLE || handle > state.last_created {
            desc.kind = HandleKind::Uncreated;
        } else {
            warn!(handle, "bad state detection");
        }
        desc
    }

    pub fn last_created(&self) -> Handle {
        self.lock_state().last_created
    }

    pub fn last_destroyed(&self) -> Handle {
        self.lock_state().last_destroyed
    }

    /// Operator dump. Uses try-lock so a wedged tracker cannot hang the
    /// bug-report thread; without the lock only the annotation is printed.
    pub fn dump(&self, printer: &mut dyn Printer) {
        printer.print_line("Tracing session tracker:");

        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(_) => {
                printer.print_line("  (possible deadlock)");
                return;
            }
        };

        printer.print_line(&format!("  Last destroyed handle: {}", state.last_destroyed));
        printer.print_line(&format!("  Last created handle: {}", state.last_created));
        printer.print_line("");
        printer.print_line("  In-flight handles:");

        for desc in state.states.values() {
            printer.print_line(&format!("    Handle {}", desc.handle));
            printer.print_line(&format!("      Kind: {}", desc.kind.as_str()));
            printer.print_line(&format!("      Engine state: {}", desc.engine_state));
            printer.print_line(&format!(
                "      Started tracing at: {}",
                desc.started_tracing_ns.unwrap_or(0)
            ));
            printer.print_line(&format!(
                "      Last transition at: {}",
                desc.last_transition_ns
            ));
        }
        if state.states.is_empty() {
            printer.print_line("    (None)");
        }
        printer.print_line("");
    }

    fn update_description(&self, desc: &mut HandleDescription, kind: HandleKind) {
        if !HandleKind::can_transition(desc.kind, kind) {
            error!(
                handle = desc.handle,
                from = desc.kind.as_str(),
                to = kind.as_str(),
                "Illegal handle kind transition"
            );
        }
        desc.kind = kind;
        desc.engine_state = self.engine.poll_state(desc.handle);
        desc.last_transition_ns = now_ns();
        if kind == HandleKind::StartedTracing {
            desc.started_tracing_ns = Some(desc.last_transition_ns);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64
}
