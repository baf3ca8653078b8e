//! libcurl transport: one blocking Easy handle per fetch.

use std::io::{self, Write};
use std::time::Duration;

use super::{FetchError, Transport};
use crate::config::BulkgetConfig;
use crate::control::CancelToken;

/// Maximum redirects followed when `follow_redirects` is on.
const MAX_REDIRECTS: u32 = 10;

/// Plain GET over libcurl. No retries, no auth, no resume.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurlTransport {
    follow_redirects: bool,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
}

impl CurlTransport {
    pub fn new(follow_redirects: bool, connect_timeout: Option<Duration>, timeout: Option<Duration>) -> Self {
        Self {
            follow_redirects,
            connect_timeout,
            timeout,
        }
    }

    pub fn from_config(cfg: &BulkgetConfig) -> Self {
        Self::new(
            cfg.follow_redirects,
            cfg.connect_timeout_secs.map(Duration::from_secs),
            cfg.fetch_timeout_secs.map(Duration::from_secs),
        )
    }
}

fn transport_err(e: curl::Error) -> FetchError {
    FetchError::Transport(e.to_string())
}

impl Transport for CurlTransport {
    fn fetch(&self, resource: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<u32, FetchError> {
        let mut easy = curl::easy::Easy::new();
        easy.url(resource).map_err(transport_err)?;
        easy.follow_location(self.follow_redirects).map_err(transport_err)?;
        if self.follow_redirects {
            easy.max_redirections(MAX_REDIRECTS).map_err(transport_err)?;
        }
        if let Some(d) = self.connect_timeout {
            easy.connect_timeout(d).map_err(transport_err)?;
        }
        if let Some(d) = self.timeout {
            easy.timeout(d).map_err(transport_err)?;
        }
        // libcurl calls the progress callback at least once a second, idle or not.
        easy.progress(true).map_err(transport_err)?;

        let mut storage_error: Option<io::Error> = None;
        let performed = {
            let mut transfer = easy.transfer();
            transfer
                .write_function(|data| match sink.write_all(data) {
                    Ok(()) => Ok(data.len()),
                    Err(e) => {
                        storage_error = Some(e);
                        Ok(0) // short count aborts the transfer
                    }
                })
                .map_err(transport_err)?;
            transfer
                .progress_function(|_, _, _, _| !cancel.is_cancelled())
                .map_err(transport_err)?;
            transfer.perform()
        };
        if let Err(e) = performed {
            if e.is_aborted_by_callback() {
                return Err(FetchError::Cancelled);
            }
            if e.is_write_error() {
                if let Some(io_err) = storage_error.take() {
                    return Err(FetchError::Storage(io_err));
                }
            }
            return Err(transport_err(e));
        }

        let code = easy.response_code().map_err(transport_err)?;
        tracing::trace!(resource, code, "transfer complete");
        Ok(code)
    }
}
