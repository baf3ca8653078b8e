//! Per-item fetch: destination file, transport call, outcome classification.
//!
//! The network side is the `Transport` trait so the worker pool and the
//! classification rules can be tested without sockets. `CurlTransport` is the
//! production implementation.

mod http;

pub use http::CurlTransport;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::config::{BulkgetConfig, LocalFaultPolicy};
use crate::control::CancelToken;
use crate::destination::destination_path;
use crate::failure::FailureRecord;

/// Error from a single transport fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// No complete response: DNS, connect, TLS, timeout, reset.
    #[error("{0}")]
    Transport(String),
    /// The sink rejected body bytes (disk full, permission denied, ...).
    #[error("storage: {0}")]
    Storage(#[source] io::Error),
    /// The batch was cancelled while the transfer was in flight.
    #[error("cancelled")]
    Cancelled,
}

/// Fetch capability injected into the workers.
pub trait Transport: Send + Sync {
    /// Fetch `resource`, streaming the body into `sink`. Returns the response status code.
    ///
    /// Sink write failures must be reported as `FetchError::Storage`. Once `cancel` is
    /// raised the transfer should stop and return `FetchError::Cancelled`.
    fn fetch(&self, resource: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<u32, FetchError>;
}

/// The destination file for an item could not be created or written.
#[derive(Debug, thiserror::Error)]
#[error("local I/O fault for {resource} at {}: {source}", .path.display())]
pub struct LocalFault {
    pub resource: String,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Result of processing one item.
#[derive(Debug)]
pub enum ItemOutcome {
    /// Body stored, status equals the success status.
    Fetched { status: u32 },
    /// Recorded, non-fatal failure.
    Failed(FailureRecord),
    /// Fatal under the abort policy.
    Fault(LocalFault),
    /// Stopped mid-transfer by the cancel token; nothing was stored or recorded.
    Cancelled,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Fetched { .. })
    }
}

/// Per-worker fetch logic. Stateless apart from settings; share by reference.
pub struct Fetcher<'a> {
    transport: &'a dyn Transport,
    output_dir: &'a Path,
    success_status: u32,
    fault_policy: LocalFaultPolicy,
    cancel: &'a CancelToken,
}

impl<'a> Fetcher<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a BulkgetConfig, cancel: &'a CancelToken) -> Self {
        Self {
            transport,
            output_dir: &config.output_dir,
            success_status: config.success_status,
            fault_policy: config.local_fault_policy,
            cancel,
        }
    }

    /// Fetch one resource into its destination file and classify the outcome.
    ///
    /// The destination is opened before any network I/O, so an unusable path
    /// faults without fetching. The body is streamed into a temp file next to
    /// the destination and renamed over it once the transfer ends, so two
    /// resources sharing a destination leave one complete body, never a mix.
    /// A transport failure leaves the destination truncated to empty. A
    /// non-success response keeps whatever body the server sent.
    pub fn fetch_item(&self, resource: &str) -> ItemOutcome {
        let path = destination_path(self.output_dir, resource);
        // No truncate here: the rename below replaces the content in one step.
        if let Err(e) = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            return self.local_fault(resource, path, e);
        }
        let tmp = match self.temp_file() {
            Ok(f) => f,
            Err(e) => return self.local_fault(resource, path, e),
        };
        let mut out = BufWriter::new(tmp);

        let status = match self.transport.fetch(resource, &mut out, self.cancel) {
            Ok(status) => status,
            Err(FetchError::Storage(e)) => return self.local_fault(resource, path, e),
            Err(FetchError::Cancelled) => {
                tracing::debug!(resource, "transfer cancelled");
                return ItemOutcome::Cancelled;
            }
            Err(FetchError::Transport(msg)) => {
                drop(out);
                if let Err(e) = File::create(&path) {
                    return self.local_fault(resource, path, e);
                }
                return ItemOutcome::Failed(FailureRecord::transport_error(resource, msg));
            }
        };
        let tmp = match out.into_inner() {
            Ok(tmp) => tmp,
            Err(e) => return self.local_fault(resource, path, e.into_error()),
        };
        if let Err(e) = tmp.persist(&path) {
            return self.local_fault(resource, path, e.error);
        }

        if status != self.success_status {
            return ItemOutcome::Failed(FailureRecord::not_ok(resource, status));
        }
        tracing::debug!(resource, status, path = %path.display(), "fetched");
        ItemOutcome::Fetched { status }
    }

    /// Hidden `.part` file in the output directory; removed on drop unless persisted.
    fn temp_file(&self) -> io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".bulkget-").suffix(".part");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(std::fs::Permissions::from_mode(0o644));
        }
        builder.tempfile_in(self.output_dir)
    }

    fn local_fault(&self, resource: &str, path: PathBuf, source: io::Error) -> ItemOutcome {
        match self.fault_policy {
            LocalFaultPolicy::Abort => ItemOutcome::Fault(LocalFault {
                resource: resource.to_string(),
                path,
                source,
            }),
            LocalFaultPolicy::Record => ItemOutcome::Failed(FailureRecord::local_io(
                resource,
                format!("{}: {}", path.display(), source),
            )),
        }
    }
}
