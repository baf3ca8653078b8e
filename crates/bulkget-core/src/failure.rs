//! Failure records and the collector workers push them into.
//!
//! The collector is a `sync_channel` sized to the item count. Each item
//! produces at most one record, so a worker's send never waits for the
//! report writer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

/// Why an item did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The transport completed but the status was not the success status.
    #[serde(rename = "NOTOK")]
    NotOk,
    /// The fetch failed before a complete response arrived (DNS, connect, timeout, reset).
    #[serde(rename = "TRANSPORT_ERROR")]
    TransportError,
    /// The destination file could not be created or written (record policy only).
    #[serde(rename = "LOCAL_IO")]
    LocalIo,
    /// Another resource in the batch already maps to the same destination file.
    #[serde(rename = "COLLISION")]
    Collision,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotOk => "NOTOK",
            FailureKind::TransportError => "TRANSPORT_ERROR",
            FailureKind::LocalIo => "LOCAL_IO",
            FailureKind::Collision => "COLLISION",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code stored when no HTTP status applies.
pub const NO_STATUS: i64 = -1;

/// One failed item. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub resource: String,
    pub status_code: i64,
    pub detail: String,
}

impl FailureRecord {
    pub fn not_ok(resource: &str, status: u32) -> Self {
        Self {
            kind: FailureKind::NotOk,
            resource: resource.to_string(),
            status_code: i64::from(status),
            detail: String::new(),
        }
    }

    pub fn transport_error(resource: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::TransportError,
            resource: resource.to_string(),
            status_code: NO_STATUS,
            detail: detail.into(),
        }
    }

    pub fn local_io(resource: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::LocalIo,
            resource: resource.to_string(),
            status_code: NO_STATUS,
            detail: detail.into(),
        }
    }

    pub fn collision(resource: &str, claimed_by: &str) -> Self {
        Self {
            kind: FailureKind::Collision,
            resource: resource.to_string(),
            status_code: NO_STATUS,
            detail: format!("destination already claimed by {}", claimed_by),
        }
    }
}

/// Report line: `KIND resource status[ detail]`. Line breaks in `detail` become spaces.
impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.resource, self.status_code)?;
        let detail = self.detail.trim();
        if !detail.is_empty() {
            let flat: String = detail
                .chars()
                .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect();
            write!(f, " {}", flat)?;
        }
        Ok(())
    }
}

/// Receiving side of the failure queue, owned by the orchestrator.
pub struct FailureCollector {
    tx: SyncSender<FailureRecord>,
    rx: Receiver<FailureRecord>,
}

impl FailureCollector {
    /// Collector that can hold `capacity` records without a reader.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        Self { tx, rx }
    }

    /// A handle for one worker.
    pub fn sender(&self) -> FailureSender {
        FailureSender(self.tx.clone())
    }

    /// Close the queue and take every record pushed so far. Never blocks.
    pub fn drain(self) -> Vec<FailureRecord> {
        drop(self.tx);
        self.rx.try_iter().collect()
    }
}

/// Worker-side handle to the failure queue.
#[derive(Clone)]
pub struct FailureSender(SyncSender<FailureRecord>);

impl FailureSender {
    /// Push a record. Falls back to a blocking send if the queue is unexpectedly full,
    /// so a record is never dropped.
    pub fn record(&self, record: FailureRecord) {
        tracing::warn!(
            kind = %record.kind,
            resource = %record.resource,
            status = record.status_code,
            "fetch failed"
        );
        match self.0.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!("failure queue full; waiting for space");
                let _ = self.0.send(record);
            }
            Err(TrySendError::Disconnected(record)) => {
                // Only after an aborted batch has already returned.
                tracing::debug!(resource = %record.resource, "failure queue closed; record dropped");
            }
        }
    }
}
