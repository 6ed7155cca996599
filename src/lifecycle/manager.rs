//! The upload lifecycle manager.
//!
//! One instance lives for the whole server process. Hosts drive it in the fixed
//! order `before_invocation -> start_invocation -> end_invocation` for every
//! command, and call `on_crash` or `on_process_shutdown` when the process goes
//! away. Out-of-order calls are rejected with `UploadError::InvalidTransition`
//! and leave the state untouched.
//!
//! Outstanding uploads are tracked as a [`PendingUploads`] snapshot. Snapshots
//! are never mutated: they are replaced wholesale behind a lock that is only
//! held for the pointer swap, so timer tasks, background drains and crash
//! handlers always observe a consistent pair of maps.

use futures::future::{join_all, try_join_all, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{SinkError, UploadError};
use crate::event::AbortReason;
use crate::lifecycle::policy::{LifecycleConfig, LifecycleState, UploadMode};
use crate::lifecycle::report::UploadReport;
use crate::lifecycle::timeouts::{describe, with_timeouts};
use crate::reporter::{Message, Notification, Reporter};
use crate::streamer::{CloseSnapshot, EventBus, Streamer};
use crate::transport::{FutureMap, Transport};

/// Uploads still in flight, with the mode that produced them.
#[derive(Debug, Clone, Default)]
pub struct PendingUploads {
    pub close: FutureMap,
    pub half_close: FutureMap,
    pub mode: UploadMode,
}

impl PendingUploads {
    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// The map the next invocation waits on before starting.
    pub fn awaited(&self) -> &FutureMap {
        match self.mode {
            UploadMode::FullyAsync => &self.half_close,
            UploadMode::Blocking | UploadMode::NonBlocking => &self.close,
        }
    }

    fn cancel_all(&self) {
        self.close.cancel_all();
        self.half_close.cancel_all();
    }
}

/// Identity of one invocation and the reporter its messages go to.
#[derive(Clone)]
pub struct InvocationContext {
    pub build_request_id: String,
    pub invocation_id: String,
    pub reporter: Arc<dyn Reporter>,
}

impl InvocationContext {
    pub fn new(
        build_request_id: impl Into<String>,
        invocation_id: impl Into<String>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            build_request_id: build_request_id.into(),
            invocation_id: invocation_id.into(),
            reporter,
        }
    }
}

struct ActiveInvocation {
    context: InvocationContext,
    streamer: Arc<Streamer>,
}

struct Inner {
    state: LifecycleState,
    active: Option<ActiveInvocation>,
}

pub struct UploadLifecycleManager {
    config: RwLock<LifecycleConfig>,
    inner: Mutex<Inner>,
    pending: Arc<RwLock<Arc<PendingUploads>>>,
}

impl Default for UploadLifecycleManager {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

impl UploadLifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config: RwLock::new(config),
            inner: Mutex::new(Inner {
                state: LifecycleState::Idle,
                active: None,
            }),
            pending: Arc::new(RwLock::new(Arc::new(PendingUploads::default()))),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Current snapshot of outstanding uploads.
    pub fn pending(&self) -> Arc<PendingUploads> {
        self.pending.read().clone()
    }

    pub fn config(&self) -> LifecycleConfig {
        *self.config.read()
    }

    /// Replace the grace periods used from the next wait on.
    pub fn configure(&self, config: LifecycleConfig) {
        *self.config.write() = config;
    }

    /// Reconcile the previous invocation's uploads before a new one starts.
    ///
    /// Waits at most the previous-invocation grace period. Whatever is still
    /// outstanding afterwards is cancelled; a failed or stuck previous upload
    /// only produces a warning.
    pub async fn before_invocation(&self, reporter: &dyn Reporter) -> Result<(), UploadError> {
        self.transition("before_invocation", LifecycleState::Idle, LifecycleState::WaitingPrevious)?;

        let snapshot = self.pending();
        if snapshot.is_empty() {
            return Ok(());
        }

        let grace = self.config().previous_invocation_grace;
        let awaited = snapshot.awaited();
        debug!(
            sinks = awaited.len(),
            mode = %snapshot.mode,
            grace_ms = grace.as_millis() as u64,
            "waiting for previous invocation's uploads"
        );
        let warning = match tokio::time::timeout(grace, try_join_all(awaited.futures())).await {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(format!(
                "Previous invocation failed to finish Build Event Protocol upload with the following exception: '{}'. Ignoring the failure and starting a new invocation...",
                err
            )),
            Err(_) => Some(format!(
                "Pending Build Event Protocol upload took more than {} to finish. Cancelling and starting a new invocation...",
                describe(grace)
            )),
        };
        // A background drain that retired the snapshot first has already reported it.
        if retire(&self.pending, &snapshot, true) {
            if let Some(warning) = warning {
                reporter.handle(Message::warn(warning));
            }
        }
        Ok(())
    }

    /// Install a streamer over `transports` and make the invocation active.
    pub fn start_invocation(
        &self,
        context: InvocationContext,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<EventBus, UploadError> {
        let streamer = Arc::new(Streamer::new(transports));
        let names = streamer.sink_names();
        let reporter = context.reporter.clone();
        {
            let mut inner = self.inner.lock();
            if inner.state != LifecycleState::WaitingPrevious {
                return Err(invalid("start_invocation", inner.state));
            }
            info!(
                invocation_id = %context.invocation_id,
                build_request_id = %context.build_request_id,
                sinks = ?names,
                "build event stream started"
            );
            inner.state = LifecycleState::Active;
            inner.active = Some(ActiveInvocation {
                context,
                streamer: streamer.clone(),
            });
        }
        reporter.post(Notification::TransportsAnnounced(names));
        Ok(EventBus::new(streamer))
    }

    /// Close every sink of the active invocation and wait per `mode`.
    ///
    /// Dropping the returned future part-way leaves the manager IDLE; the
    /// published uploads are reconciled by the next `before_invocation`.
    pub async fn end_invocation(&self, mode: UploadMode) -> Result<UploadReport, UploadError> {
        let active = {
            let mut inner = self.inner.lock();
            if inner.state != LifecycleState::Active {
                return Err(invalid("end_invocation", inner.state));
            }
            inner.state = LifecycleState::Closing;
            inner.active.take()
        };
        let _closing = ClosingGuard(&self.inner);
        let Some(ActiveInvocation { context, streamer }) = active else {
            return Ok(UploadReport::empty(mode));
        };

        let closed = if streamer.is_closed() {
            streamer.close(None)
        } else {
            warn!(invocation_id = %context.invocation_id, "event stream was not properly closed");
            streamer.close(Some(AbortReason::Internal))
        };
        let snapshot = self.publish(&closed, mode);

        let report = match mode {
            UploadMode::Blocking => self.wait_blocking(&context, &snapshot).await,
            UploadMode::NonBlocking | UploadMode::FullyAsync => {
                for name in snapshot.close.names() {
                    context.reporter.post(Notification::TransportClosed(name));
                }
                self.drain_in_background(snapshot.clone(), context.reporter.clone());
                UploadReport::from_map(mode, &snapshot.close)
            }
        };

        info!(
            invocation_id = %context.invocation_id,
            mode = %mode,
            outstanding = !self.pending().is_empty(),
            "build event stream finished"
        );
        Ok(report)
    }

    /// Abort the active invocation after a crash. Never fails.
    pub async fn on_crash(&self) {
        let active = {
            let mut inner = self.inner.lock();
            if inner.state == LifecycleState::Crashed {
                return;
            }
            inner.state = LifecycleState::Crashed;
            inner.active.take()
        };
        if let Some(active) = active {
            warn!(invocation_id = %active.context.invocation_id, "Attempting to close build event streamer on crash");
            let closed = active.streamer.close(Some(AbortReason::Internal));
            self.publish(&closed, UploadMode::Blocking);
        }
        let grace = self.config().crash_grace;
        self.settle(grace, "crash").await;
    }

    /// Wind down at process exit. Uses the shutdown grace period since no later
    /// invocation will reconcile leftovers.
    pub async fn on_process_shutdown(&self) {
        let active = {
            let mut inner = self.inner.lock();
            if inner.state == LifecycleState::Crashed {
                return;
            }
            inner.active.take()
        };
        if let Some(active) = active {
            warn!(invocation_id = %active.context.invocation_id, "closing build event stream at shutdown");
            let closed = active.streamer.close(Some(AbortReason::Internal));
            self.publish(&closed, UploadMode::Blocking);
        }
        let grace = self.config().shutdown_grace;
        self.settle(grace, "shutdown").await;

        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Crashed {
            inner.state = LifecycleState::Idle;
        }
    }

    fn transition(
        &self,
        op: &'static str,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), UploadError> {
        let mut inner = self.inner.lock();
        if inner.state != from {
            return Err(invalid(op, inner.state));
        }
        inner.state = to;
        Ok(())
    }

    /// Give up on an invocation reconciled by `before_invocation` that will
    /// never start, e.g. because the host rejected its options.
    pub fn abandon_invocation(&self) -> Result<(), UploadError> {
        self.transition("abandon_invocation", LifecycleState::WaitingPrevious, LifecycleState::Idle)
    }

    /// Wrap the streamer's maps with per-sink timeouts and make them current.
    fn publish(&self, closed: &CloseSnapshot, mode: UploadMode) -> Arc<PendingUploads> {
        let snapshot = Arc::new(PendingUploads {
            close: with_timeouts(&closed.close),
            half_close: with_timeouts(&closed.half_close),
            mode,
        });
        *self.pending.write() = snapshot.clone();
        snapshot
    }

    async fn wait_blocking(
        &self,
        context: &InvocationContext,
        snapshot: &Arc<PendingUploads>,
    ) -> UploadReport {
        let cap = self.config().max_blocking_wait;
        let waits = snapshot.close.iter().map(|entry| {
            let reporter = context.reporter.clone();
            let name = entry.name().to_string();
            entry.future().clone().map(move |result| {
                reporter.post(Notification::TransportClosed(name));
                result
            })
        });

        let _ticker = ProgressTicker::start(context.reporter.clone(), longest_wait(&snapshot.close, cap));
        match tokio::time::timeout(cap, join_all(waits)).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    warn_on_close_failure(context.reporter.as_ref(), &err);
                }
                retire(&self.pending, snapshot, false);
            }
            Err(_) => {
                context.reporter.handle(Message::warn(format!(
                    "The Build Event Protocol upload timed out after {}; remaining uploads continue in the background",
                    describe(cap)
                )));
            }
        }
        UploadReport::from_map(UploadMode::Blocking, &snapshot.close)
    }

    /// Wait for a non-blocking invocation's closes off the caller's task.
    /// Failures are reported unless the next `before_invocation` already took
    /// over the snapshot.
    fn drain_in_background(&self, snapshot: Arc<PendingUploads>, reporter: Arc<dyn Reporter>) {
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let results = join_all(snapshot.close.futures()).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            debug!(sinks = results.len(), failed, "background upload drain finished");
            if !retire(&pending, &snapshot, false) {
                return;
            }
            for err in results.into_iter().filter_map(Result::err) {
                if matches!(err, SinkError::Cancelled { .. }) {
                    continue;
                }
                warn!(sink = %err.sink(), error = %err, "background build event upload did not complete");
                warn_on_close_failure(reporter.as_ref(), &err);
            }
        });
    }

    async fn settle(&self, grace: Duration, phase: &'static str) {
        let snapshot = self.pending();
        if snapshot.is_empty() {
            return;
        }
        match tokio::time::timeout(grace, join_all(snapshot.close.futures())).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    warn!(sink = %err.sink(), error = %err, phase, "build event upload did not complete");
                }
            }
            Err(_) => warn!(
                grace_ms = grace.as_millis() as u64,
                phase,
                "build event uploads still outstanding after grace period; cancelling"
            ),
        }
        retire(&self.pending, &snapshot, true);
    }
}

fn invalid(op: &'static str, state: LifecycleState) -> UploadError {
    UploadError::InvalidTransition {
        op,
        state: state.to_string(),
    }
}

/// Clear `snapshot` if it is still current, optionally cancelling its sinks.
/// Returns whether this call cleared it.
fn retire(
    pending: &RwLock<Arc<PendingUploads>>,
    snapshot: &Arc<PendingUploads>,
    cancel: bool,
) -> bool {
    let cleared = {
        let mut current = pending.write();
        let cleared = Arc::ptr_eq(&current, snapshot);
        if cleared {
            *current = Arc::new(PendingUploads::default());
        }
        cleared
    };
    if cancel {
        snapshot.cancel_all();
    }
    cleared
}

/// Returns a CLOSING manager to IDLE on every exit from `end_invocation`,
/// including when its future is dropped mid-wait.
struct ClosingGuard<'a>(&'a Mutex<Inner>);

impl Drop for ClosingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.0.lock();
        if inner.state == LifecycleState::Closing {
            inner.state = LifecycleState::Idle;
        }
    }
}

/// Transmission failures were already reported by the sink itself.
fn warn_on_close_failure(reporter: &dyn Reporter, err: &SinkError) {
    match err {
        SinkError::Transmission { .. } => {}
        _ => reporter.handle(Message::warn(err.to_string())),
    }
}

/// Upper bound shown to the user while waiting.
fn longest_wait(map: &FutureMap, cap: Duration) -> Duration {
    let mut longest = Duration::ZERO;
    for entry in map.iter() {
        let bound = entry.transport().timeout();
        if bound.is_zero() {
            return cap;
        }
        longest = longest.max(bound);
    }
    longest.min(cap)
}

/// Posts a progress message every second while a blocking wait is running.
struct ProgressTicker(AbortHandle);

impl ProgressTicker {
    fn start(reporter: Arc<dyn Reporter>, at_most: Duration) -> Self {
        let period = Duration::from_secs(1);
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(started + period, period);
            loop {
                ticks.tick().await;
                reporter.handle(Message::progress(format!(
                    "Waiting for Build Event Protocol upload. Waited {}s, waiting at most {}s.",
                    started.elapsed().as_secs(),
                    at_most.as_secs()
                )));
            }
        });
        Self(handle.abort_handle())
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.0.abort();
    }
}
