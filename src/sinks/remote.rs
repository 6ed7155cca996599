//! Remote streaming backend.
//!
//! Events are buffered into batches and POSTed to
//! `<endpoint>/v1/invocations/<invocation_id>/events`. The sink half-closes once
//! the final batch is accepted and completes once
//! `<endpoint>/v1/invocations/<invocation_id>/ack` reports every sent sequence.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::BackendOptions;
use crate::event::BuildEvent;
use crate::lifecycle::InvocationContext;
use crate::reporter::Reporter;
use crate::transport::{ChannelTransport, EventWriter};

const BACKEND_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKEND_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One POST body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub build_request_id: String,
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub first_sequence: u64,
    pub events: Vec<BuildEvent>,
    pub last_batch: bool,
}

impl EventBatch {
    pub fn last_sequence(&self) -> Option<u64> {
        self.events.last().map(|e| e.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckStatus {
    pub acknowledged_sequence: u64,
}

/// Transport to the ingestion service.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn publish(&self, batch: &EventBatch) -> anyhow::Result<()>;

    async fn acknowledged_sequence(&self, invocation_id: &str) -> anyhow::Result<u64>;
}

pub struct HttpBackendClient {
    client: Client,
    endpoint: String,
}

impl HttpBackendClient {
    pub fn new(options: &BackendOptions) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(BACKEND_HTTP_CONNECT_TIMEOUT)
            .timeout(BACKEND_HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: options.endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn invocation_url(&self, invocation_id: &str, leaf: &str) -> String {
        format!("{}/v1/invocations/{}/{}", self.endpoint, invocation_id, leaf)
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn publish(&self, batch: &EventBatch) -> anyhow::Result<()> {
        let url = self.invocation_url(&batch.invocation_id, "events");
        let response = self.client.post(&url).json(batch).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("backend rejected events ({}): {}", status, body);
        }
        Ok(())
    }

    async fn acknowledged_sequence(&self, invocation_id: &str) -> anyhow::Result<u64> {
        let url = self.invocation_url(invocation_id, "ack");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("backend ack query failed ({})", response.status());
        }
        let ack: AckStatus = response.json().await?;
        Ok(ack.acknowledged_sequence)
    }
}

pub struct RemoteWriter {
    client: Arc<dyn BackendClient>,
    build_request_id: String,
    invocation_id: String,
    project_id: Option<String>,
    keywords: Vec<String>,
    batch_size: usize,
    poll_interval: Duration,
    buffer: Vec<BuildEvent>,
    last_sent: u64,
}

impl RemoteWriter {
    pub fn new(
        client: Arc<dyn BackendClient>,
        options: &BackendOptions,
        context: &InvocationContext,
    ) -> Self {
        Self {
            client,
            build_request_id: context.build_request_id.clone(),
            invocation_id: context.invocation_id.clone(),
            project_id: options.project_id.clone(),
            keywords: options
                .keywords
                .iter()
                .map(|k| format!("user_keyword={}", k))
                .collect(),
            batch_size: options.batch_size.max(1),
            poll_interval: options.ack_poll_interval(),
            buffer: Vec::new(),
            last_sent: 0,
        }
    }

    async fn send(&mut self, last_batch: bool) -> anyhow::Result<()> {
        let events = std::mem::take(&mut self.buffer);
        let batch = EventBatch {
            build_request_id: self.build_request_id.clone(),
            invocation_id: self.invocation_id.clone(),
            project_id: self.project_id.clone(),
            keywords: self.keywords.clone(),
            first_sequence: events.first().map_or(self.last_sent + 1, |e| e.sequence),
            events,
            last_batch,
        };
        self.client.publish(&batch).await?;
        if let Some(last) = batch.last_sequence() {
            self.last_sent = last;
        }
        debug!(
            invocation_id = %self.invocation_id,
            first_sequence = batch.first_sequence,
            events = batch.events.len(),
            last_batch,
            "published build event batch"
        );
        Ok(())
    }
}

#[async_trait]
impl EventWriter for RemoteWriter {
    async fn write(&mut self, event: &BuildEvent) -> anyhow::Result<()> {
        self.buffer.push(event.clone());
        if self.buffer.len() >= self.batch_size {
            self.send(false).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.send(true).await
    }

    async fn acknowledge(&mut self) -> anyhow::Result<()> {
        loop {
            let acked = self.client.acknowledged_sequence(&self.invocation_id).await?;
            if acked >= self.last_sent {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

pub fn open_remote_sink(
    name: &str,
    client: Arc<dyn BackendClient>,
    options: &BackendOptions,
    context: &InvocationContext,
    reporter: Arc<dyn Reporter>,
) -> ChannelTransport {
    let writer = RemoteWriter::new(client, options, context);
    ChannelTransport::spawn(name, options.timeout(), writer, reporter)
}
