//! Shared fakes for integration tests: scriptable transports and backends.

use async_trait::async_trait;
use bepstream::config::BackendOptions;
use bepstream::error::SinkError;
use bepstream::event::BuildEvent;
use bepstream::module::BackendConnector;
use bepstream::sinks::{BackendClient, EventBatch};
use bepstream::transport::{CloseFuture, SinkId, Transport};
use futures::future::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type Signal = Mutex<Option<oneshot::Sender<Result<(), SinkError>>>>;

/// Transport whose completion is driven by the test.
pub struct FakeTransport {
    id: SinkId,
    name: String,
    timeout: Duration,
    events: Mutex<Vec<BuildEvent>>,
    closes: AtomicUsize,
    cancelled: AtomicBool,
    auto_complete: bool,
    completion: CloseFuture,
    half_close: CloseFuture,
    complete_tx: Signal,
    half_tx: Signal,
}

fn signal(name: &str) -> (oneshot::Sender<Result<(), SinkError>>, CloseFuture) {
    let (tx, rx) = oneshot::channel();
    let sink = name.to_string();
    let future = rx
        .map(move |r| r.unwrap_or(Err(SinkError::Cancelled { sink })))
        .boxed()
        .shared();
    (tx, future)
}

impl FakeTransport {
    fn build(name: &str, timeout: Duration, auto_complete: bool) -> Arc<Self> {
        let (complete_tx, completion) = signal(name);
        let (half_tx, half_close) = signal(name);
        Arc::new(Self {
            id: SinkId::next(),
            name: name.to_string(),
            timeout,
            events: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            auto_complete,
            completion,
            half_close,
            complete_tx: Mutex::new(Some(complete_tx)),
            half_tx: Mutex::new(Some(half_tx)),
        })
    }

    /// Acknowledges everything as soon as it is closed.
    pub fn succeeding(name: &str, timeout: Duration) -> Arc<Self> {
        Self::build(name, timeout, true)
    }

    /// Half-closes on close but never acknowledges on its own.
    pub fn never_acking(name: &str, timeout: Duration) -> Arc<Self> {
        Self::build(name, timeout, false)
    }

    /// Resolve the completion future by hand.
    pub fn complete(&self, result: Result<(), SinkError>) {
        if let Some(tx) = self.complete_tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.kind.clone()).collect()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
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
        if !self.was_cancelled() {
            self.events.lock().push(event.clone());
        }
    }

    fn close(&self) -> CloseFuture {
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(tx) = self.half_tx.lock().take() {
                let _ = tx.send(Ok(()));
            }
            if self.auto_complete {
                self.complete(Ok(()));
            }
        }
        self.completion.clone()
    }

    fn half_close_future(&self) -> CloseFuture {
        self.half_close.clone()
    }

    /// Dropping the senders resolves outstanding futures as cancelled.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.complete_tx.lock().take();
        self.half_tx.lock().take();
    }
}

pub fn as_transports(fakes: &[Arc<FakeTransport>]) -> Vec<Arc<dyn Transport>> {
    fakes
        .iter()
        .map(|f| f.clone() as Arc<dyn Transport>)
        .collect()
}

/// In-memory backend. Acknowledges every published sequence unless told not to.
#[derive(Default)]
pub struct FakeBackend {
    pub batches: Mutex<Vec<EventBatch>>,
    pub withhold_ack: AtomicBool,
}

impl FakeBackend {
    pub fn published_sequences(&self) -> Vec<u64> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.events.iter().map(|e| e.sequence))
            .collect()
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn publish(&self, batch: &EventBatch) -> anyhow::Result<()> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    async fn acknowledged_sequence(&self, _invocation_id: &str) -> anyhow::Result<u64> {
        if self.withhold_ack.load(Ordering::SeqCst) {
            return Ok(0);
        }
        Ok(self.published_sequences().into_iter().max().unwrap_or(0))
    }
}

/// Connector handing out `backend`, counting how often it is called.
pub fn counting_connector(backend: Arc<FakeBackend>, calls: Arc<AtomicUsize>) -> BackendConnector {
    Arc::new(move |_options: &BackendOptions| {
        calls.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn BackendClient> = backend.clone();
        Ok(client)
    })
}
