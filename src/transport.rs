//! Sink (transport) abstraction.
//!
//! A transport receives a copy of the build event stream and owns the close
//! handshake with its destination. Closing is asynchronous: `close()` returns a
//! shared completion future that resolves once the destination has acknowledged
//! everything, and `half_close_future()` resolves once all data has been handed
//! to the destination.
//!
//! [`ChannelTransport`] provides the plumbing shared by every concrete sink: one
//! tokio task per sink, fed through an unbounded channel so per-sink event order
//! is the order of `accept` calls, and a pair of one-shot completion signals.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::event::BuildEvent;
use crate::reporter::{Message, Reporter};

/// Completion signal of a sink. Resolves at most once; every clone observes the
/// same result.
pub type CloseFuture = Shared<BoxFuture<'static, Result<(), SinkError>>>;

/// Already-resolved completion signal.
pub fn resolved(result: Result<(), SinkError>) -> CloseFuture {
    futures::future::ready(result).boxed().shared()
}

/// Identity of a sink within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SinkId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

pub trait Transport: Send + Sync {
    fn id(&self) -> SinkId;

    fn name(&self) -> &str;

    /// Bound after which an outstanding close counts as a non-fatal timeout.
    /// `Duration::ZERO` means the sink declares no bound.
    fn timeout(&self) -> Duration;

    /// Buffer or transmit one event. Never blocks on the destination.
    fn accept(&self, event: &BuildEvent);

    /// Start asynchronous finalization and return the completion future.
    /// Calling it again returns the same future.
    fn close(&self) -> CloseFuture;

    /// Resolves once all data has been sent and only the acknowledgment is
    /// outstanding.
    fn half_close_future(&self) -> CloseFuture;

    /// Advisory cancellation. The sink stops accepting events; its background
    /// work winds down at its next suspension point.
    fn cancel(&self);
}

/// One sink and its (possibly timeout-wrapped) completion future.
#[derive(Clone)]
pub struct FutureEntry {
    transport: Arc<dyn Transport>,
    future: CloseFuture,
    timer: Option<AbortHandle>,
}

impl FutureEntry {
    pub fn new(transport: Arc<dyn Transport>, future: CloseFuture) -> Self {
        Self {
            transport,
            future,
            timer: None,
        }
    }

    /// Entry whose future is driven by a dedicated timer task.
    pub(crate) fn with_timer(
        transport: Arc<dyn Transport>,
        future: CloseFuture,
        timer: AbortHandle,
    ) -> Self {
        Self {
            transport,
            future,
            timer: Some(timer),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn future(&self) -> &CloseFuture {
        &self.future
    }

    /// Result, if the future has already resolved.
    pub fn peek(&self) -> Option<Result<(), SinkError>> {
        self.future.peek().cloned()
    }

    fn cancel(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.transport.cancel();
    }
}

/// Immutable mapping from sink to completion future, in registration order.
#[derive(Clone, Default)]
pub struct FutureMap {
    entries: Vec<FutureEntry>,
}

impl FutureMap {
    pub fn new(entries: Vec<FutureEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FutureEntry> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&CloseFuture> {
        self.entries
            .iter()
            .find(|entry| entry.name() == name)
            .map(|entry| &entry.future)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn futures(&self) -> Vec<CloseFuture> {
        self.entries.iter().map(|e| e.future.clone()).collect()
    }

    /// Best-effort cancellation of every entry. Returns immediately.
    pub fn cancel_all(&self) {
        for entry in &self.entries {
            entry.cancel();
        }
    }
}

impl FromIterator<FutureEntry> for FutureMap {
    fn from_iter<I: IntoIterator<Item = FutureEntry>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Debug for FutureMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|e| e.name())).finish()
    }
}

/// Destination-specific half of a [`ChannelTransport`].
#[async_trait]
pub trait EventWriter: Send + 'static {
    async fn write(&mut self, event: &BuildEvent) -> anyhow::Result<()>;

    /// Hand every buffered byte to the destination.
    async fn flush(&mut self) -> anyhow::Result<()>;

    /// Wait for the destination to acknowledge everything flushed.
    async fn acknowledge(&mut self) -> anyhow::Result<()>;
}

enum Command {
    Event(BuildEvent),
    Close,
}

#[derive(Default)]
struct ChannelState {
    closing: bool,
    cancelled: bool,
}

/// Transport backed by a dedicated tokio task driving an [`EventWriter`].
pub struct ChannelTransport {
    id: SinkId,
    name: String,
    timeout: Duration,
    sender: mpsc::UnboundedSender<Command>,
    state: Mutex<ChannelState>,
    completion: CloseFuture,
    half_close: CloseFuture,
    worker: AbortHandle,
}

impl ChannelTransport {
    /// Spawn the sink task. Must be called within a tokio runtime.
    pub fn spawn<W: EventWriter>(
        name: impl Into<String>,
        timeout: Duration,
        writer: W,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (half_tx, half_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let worker = tokio::spawn(run_worker(
            name.clone(),
            writer,
            receiver,
            reporter,
            half_tx,
            done_tx,
        ))
        .abort_handle();

        Self {
            id: SinkId::next(),
            completion: signal_future(name.clone(), done_rx),
            half_close: signal_future(name.clone(), half_rx),
            name,
            timeout,
            sender,
            state: Mutex::new(ChannelState::default()),
            worker,
        }
    }
}

/// A dropped sender means the worker was cancelled before it could signal.
fn signal_future(
    name: String,
    receiver: oneshot::Receiver<Result<(), SinkError>>,
) -> CloseFuture {
    receiver
        .map(move |signal| signal.unwrap_or(Err(SinkError::Cancelled { sink: name })))
        .boxed()
        .shared()
}

impl Transport for ChannelTransport {
    fn id(&self) -> SinkId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn accept(&self, event: &BuildEvent) {
        let state = self.state.lock();
        if state.closing || state.cancelled {
            debug!(sink = %self.name, sequence = event.sequence, "dropping event for closed sink");
            return;
        }
        if self.sender.send(Command::Event(event.clone())).is_err() {
            debug!(sink = %self.name, "sink task is gone; event dropped");
        }
    }

    fn close(&self) -> CloseFuture {
        let mut state = self.state.lock();
        if !state.closing {
            state.closing = true;
            let _ = self.sender.send(Command::Close);
        }
        self.completion.clone()
    }

    fn half_close_future(&self) -> CloseFuture {
        self.half_close.clone()
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.cancelled {
            state.cancelled = true;
            debug!(sink = %self.name, "cancelling sink task");
            self.worker.abort();
        }
    }
}

async fn run_worker<W: EventWriter>(
    name: String,
    mut writer: W,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    reporter: Arc<dyn Reporter>,
    half_tx: oneshot::Sender<Result<(), SinkError>>,
    done_tx: oneshot::Sender<Result<(), SinkError>>,
) {
    let mut failure: Option<SinkError> = None;

    while let Some(command) = receiver.recv().await {
        match command {
            Command::Event(event) => {
                if failure.is_some() {
                    continue;
                }
                if let Err(err) = writer.write(&event).await {
                    failure = Some(report_failure(&name, &reporter, err));
                }
            }
            Command::Close => break,
        }
    }

    if let Some(err) = failure {
        let _ = half_tx.send(Err(err.clone()));
        let _ = done_tx.send(Err(err));
        return;
    }

    if let Err(err) = writer.flush().await {
        let err = report_failure(&name, &reporter, err);
        let _ = half_tx.send(Err(err.clone()));
        let _ = done_tx.send(Err(err));
        return;
    }
    let _ = half_tx.send(Ok(()));

    let result = writer
        .acknowledge()
        .await
        .map_err(|err| report_failure(&name, &reporter, err));
    debug!(sink = %name, ok = result.is_ok(), "sink closed");
    let _ = done_tx.send(result);
}

/// Report a mid-stream failure on the invocation's error channel. Only this sink
/// degrades; the rest of the stream is dropped for it.
fn report_failure(name: &str, reporter: &Arc<dyn Reporter>, err: anyhow::Error) -> SinkError {
    let err = SinkError::Transmission {
        sink: name.to_string(),
        reason: format!("{:#}", err),
    };
    warn!(sink = %name, error = %err, "build event sink failed");
    reporter.handle(Message::error(err.to_string()));
    err
}
