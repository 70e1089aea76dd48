//! Circuit-breaker uploads.
//!
//! A drained batch gets exactly one upload attempt. Whatever happens next,
//! the batch is dropped: success needs no bookkeeping, failure is logged and
//! the data is lost. There is no retry, no on-disk queue, and no re-enqueue
//! into the live table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{GridCell, PulseKind, UploadError};

/// One cell as sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub lat: f64,
    pub lng: f64,
    #[serde(rename = "type")]
    pub kind: PulseKind,
    pub intensity: u32,
    pub floor: i32,
}

impl From<&GridCell> for UploadRecord {
    fn from(cell: &GridCell) -> Self {
        Self {
            lat: cell.latitude,
            lng: cell.longitude,
            kind: cell.kind,
            intensity: cell.intensity,
            floor: cell.floor,
        }
    }
}

/// Snapshot of the grid taken at flush time. Lives for one upload attempt.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    cells: Vec<GridCell>,
    /// Engine clock at drain time (epoch ms)
    pub drained_at_ms: i64,
}

impl PendingBatch {
    pub fn new(cells: Vec<GridCell>, drained_at_ms: i64) -> Self {
        Self { cells, drained_at_ms }
    }

    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Request body records, in table order.
    pub fn records(&self) -> Vec<UploadRecord> {
        self.cells.iter().map(UploadRecord::from).collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, UploadError> {
        serde_json::to_vec(&self.records()).map_err(|e| UploadError::Encode(e.to_string()))
    }
}

/// Destination for drained batches.
pub trait BatchSink: Send + Sync {
    /// Make one attempt to deliver `batch`, authenticated with `token`.
    fn upload<'a>(&'a self, token: &'a str, batch: &'a PendingBatch) -> BoxFuture<'a, Result<(), UploadError>>;
}

/// The auth token currently held by the host, if any.
#[derive(Debug, Default)]
pub struct CredentialStore {
    token: RwLock<Option<String>>,
}

impl CredentialStore {
    pub fn set(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_set(&self) -> bool {
        self.token.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Upload outcome counters.
#[derive(Debug, Default)]
pub(crate) struct UploadCounters {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub unauthenticated: AtomicU64,
}

/// Hands batches to a [`BatchSink`] under the drop-on-failure policy.
pub(crate) struct CircuitBreaker {
    sink: Arc<dyn BatchSink>,
    credentials: CredentialStore,
    counters: Arc<UploadCounters>,
}

impl CircuitBreaker {
    pub fn new(sink: Arc<dyn BatchSink>) -> Self {
        Self {
            sink,
            credentials: CredentialStore::default(),
            counters: Arc::new(UploadCounters::default()),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn counters(&self) -> &UploadCounters {
        &self.counters
    }

    /// Start the single upload attempt for `batch` and return without waiting.
    ///
    /// Without a credential the batch is discarded on the spot and nothing is
    /// spawned. Must be called inside a tokio runtime.
    pub fn dispatch(&self, batch: PendingBatch) -> Option<JoinHandle<()>> {
        let Some(token) = self.credentials.get() else {
            debug!("[Uploader] no credential, discarding batch of {} cells", batch.len());
            self.counters.unauthenticated.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        Some(tokio::spawn(async move {
            let start = Instant::now();
            match sink.upload(&token, &batch).await {
                Ok(()) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "[Uploader] sent {} cells drained at {} in {:?}",
                        batch.len(),
                        batch.drained_at_ms,
                        start.elapsed()
                    );
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[Uploader] upload failed after {:?}, dropping {} cells drained at {}: {}",
                        start.elapsed(),
                        batch.len(),
                        batch.drained_at_ms,
                        e
                    );
                }
            }
        }))
    }
}
