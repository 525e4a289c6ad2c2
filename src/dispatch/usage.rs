use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Completed,
    Cancelled,
    Failed,
}

/// Append-only billing/telemetry fact, one per completed or cancelled
/// request. The gateway hands it to the sink and keeps no copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub model_id: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_cents: i64,
    pub latency_ms: u64,
    pub endpoint: String,
    pub status: UsageStatus,
    pub timestamp: DateTime<Utc>,
}

/// Destination for usage records; an external collaborator in production.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;
}

/// Bounded handoff between request tasks and the sink. A slow or failing
/// sink can never delay a response or pile up unbounded tasks: the queue
/// drops on overflow and the consumer swallows sink errors.
#[derive(Clone)]
pub struct UsageLogger {
    tx: mpsc::Sender<UsageRecord>,
}

impl UsageLogger {
    pub fn spawn(sink: Arc<dyn UsageSink>, queue_size: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UsageRecord>(queue_size.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let id = record.id;
                if let Err(e) = sink.record(record).await {
                    warn!("Usage sink rejected record {}: {}", id, e);
                }
            }
            debug!("Usage logger draining complete");
        });
        (Self { tx }, handle)
    }

    /// Fire-and-forget submit. Never blocks the response path.
    pub fn submit(&self, record: UsageRecord) {
        if let Err(e) = self.tx.try_send(record) {
            warn!("Usage queue full or closed, dropping record: {}", e);
        }
    }
}

/// In-memory sink for tests and local diagnostics.
#[derive(Default)]
pub struct MemorySink {
    records: parking_lot::Mutex<Vec<UsageRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl UsageSink for MemorySink {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
