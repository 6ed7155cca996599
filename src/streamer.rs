//! Per-invocation fan-out of build events to sinks.

use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::event::{AbortReason, BuildEvent};
use crate::transport::{FutureEntry, FutureMap, Transport};

/// Source of the command's captured stdout/stderr, drained in chunks.
pub trait OutErrProvider: Send + Sync {
    fn take_out(&self) -> Vec<String>;
    fn take_err(&self) -> Vec<String>;
}

/// Future maps captured exactly once, when the streamer closes.
#[derive(Debug, Clone, Default)]
pub struct CloseSnapshot {
    pub close: FutureMap,
    pub half_close: FutureMap,
}

struct StreamState {
    next_sequence: u64,
    closed: Option<Arc<CloseSnapshot>>,
    abort: Option<AbortReason>,
}

/// Orchestrates one invocation's event stream.
///
/// Events are numbered from 1 in arrival order and forwarded to every sink in
/// registration order while the state lock is held, so each sink sees the
/// stream in sequence.
pub struct Streamer {
    transports: Vec<Arc<dyn Transport>>,
    state: Mutex<StreamState>,
    out_err: Mutex<Option<Arc<dyn OutErrProvider>>>,
}

impl Streamer {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            transports,
            state: Mutex::new(StreamState {
                next_sequence: 1,
                closed: None,
                abort: None,
            }),
            out_err: Mutex::new(None),
        }
    }

    /// Attach the captured-output source. Its contents are posted as
    /// `progress` events on `flush_output` and before the stream closes.
    pub fn register_out_err(&self, provider: Arc<dyn OutErrProvider>) {
        *self.out_err.lock() = Some(provider);
    }

    /// Post whatever output has been captured so far.
    pub fn flush_output(&self) {
        let mut state = self.state.lock();
        if state.closed.is_none() {
            self.drain_output(&mut state);
        }
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.transports.iter().map(|t| t.name().to_string()).collect()
    }

    /// Forward one event. Events posted after close are dropped. An event
    /// flagged `last_message` closes the stream.
    pub fn post(&self, event: BuildEvent) {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            debug!(kind = %event.kind, "event posted after stream close; dropped");
            return;
        }
        let last = event.last_message;
        if last {
            self.drain_output(&mut state);
        }
        Self::fan_out(&self.transports, &mut state, event);
        if last {
            state.closed = Some(Arc::new(self.initiate_close()));
        }
    }

    /// Close the stream and every sink. With a reason, an `aborted` event is
    /// delivered to every sink first. Repeated calls return the first snapshot.
    pub fn close(&self, reason: Option<AbortReason>) -> Arc<CloseSnapshot> {
        let mut state = self.state.lock();
        if let Some(snapshot) = &state.closed {
            return snapshot.clone();
        }
        self.drain_output(&mut state);
        if let Some(reason) = reason {
            info!(reason = reason.as_str(), sinks = self.transports.len(), "aborting build event stream");
            state.abort = Some(reason);
            Self::fan_out(&self.transports, &mut state, BuildEvent::aborted(reason));
        }
        let snapshot = Arc::new(self.initiate_close());
        state.closed = Some(snapshot.clone());
        snapshot
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.state.lock().abort
    }

    /// Completion futures captured at close; empty while the stream is open.
    pub fn close_futures_map(&self) -> FutureMap {
        self.state
            .lock()
            .closed
            .as_ref()
            .map(|s| s.close.clone())
            .unwrap_or_default()
    }

    /// Half-close futures captured at close; empty while the stream is open.
    pub fn half_closed_map(&self) -> FutureMap {
        self.state
            .lock()
            .closed
            .as_ref()
            .map(|s| s.half_close.clone())
            .unwrap_or_default()
    }

    /// One `progress` event per chunk pair. Lock order: stream state, then
    /// provider, then the provider's buffers.
    fn drain_output(&self, state: &mut StreamState) {
        let Some(provider) = self.out_err.lock().clone() else {
            return;
        };
        let out = provider.take_out();
        let err = provider.take_err();
        for i in 0..out.len().max(err.len()) {
            let event = BuildEvent::new(
                "progress",
                json!({
                    "stdout": out.get(i).map_or("", String::as_str),
                    "stderr": err.get(i).map_or("", String::as_str),
                }),
            );
            Self::fan_out(&self.transports, state, event);
        }
    }

    fn fan_out(transports: &[Arc<dyn Transport>], state: &mut StreamState, event: BuildEvent) {
        let event = event.with_sequence(state.next_sequence);
        state.next_sequence += 1;
        for transport in transports {
            transport.accept(&event);
        }
    }

    fn initiate_close(&self) -> CloseSnapshot {
        let close = self
            .transports
            .iter()
            .map(|t| FutureEntry::new(t.clone(), t.close()))
            .collect();
        let half_close = self
            .transports
            .iter()
            .map(|t| FutureEntry::new(t.clone(), t.half_close_future()))
            .collect();
        CloseSnapshot { close, half_close }
    }
}

/// Event source handed to the build engine for the active invocation.
#[derive(Clone)]
pub struct EventBus {
    streamer: Arc<Streamer>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.streamer.sink_names())
            .field("finished", &self.finished())
            .finish()
    }
}

impl EventBus {
    pub fn new(streamer: Arc<Streamer>) -> Self {
        Self { streamer }
    }

    pub fn produce(&self, event: BuildEvent) {
        self.streamer.post(event);
    }

    /// True once the stream has been closed, by a last event or an abort.
    pub fn finished(&self) -> bool {
        self.streamer.is_closed()
    }

    pub fn abort(&self, reason: AbortReason) {
        self.streamer.close(Some(reason));
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.streamer.sink_names()
    }

    pub fn streamer(&self) -> &Arc<Streamer> {
        &self.streamer
    }
}
