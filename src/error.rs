//! Error taxonomy for the collector.
//!
//! Every error raised inside a pod's loop is caught at the loop boundary and
//! turned into a skip, a delay or a retry. Only a failed first directory fetch
//! is allowed to stop the process.

use std::path::PathBuf;

use thiserror::Error;

use crate::client::SinkError;

/// Errors produced by the collection engine.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Batch discovery failed (fetch, parse, or an error status in the payload).
    /// Swallowed; the next tick retries.
    #[error("poll of {target_url} failed: {reason}")]
    Poll { target_url: String, reason: String },

    /// More bytes were delivered than the endpoint reports for the batch.
    /// The batch is skipped permanently.
    #[error(
        "integrity violation on {target_url} batch {batch_id}: delivered {delivered} bytes, batch size is {batch_size}"
    )]
    Integrity {
        target_url: String,
        batch_id: u64,
        delivered: u64,
        batch_size: u64,
    },

    /// The batch body stream broke mid-way. Resumed from the committed offset
    /// on the next tick.
    #[error("stream of {target_url} batch {batch_id} failed: {reason}")]
    Stream {
        target_url: String,
        batch_id: u64,
        reason: String,
    },

    /// A record could not be shipped to the sink.
    #[error("sink delivery failed: {0}")]
    SinkDelivery(#[from] SinkError),

    /// The desired endpoint set could not be fetched.
    #[error("directory fetch failed: {0}")]
    Directory(String),

    /// Offset ledger I/O failed.
    #[error("offset ledger I/O failed at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An HTTP client could not be built.
    #[error("http client setup failed: {0}")]
    Setup(String),
}

impl CollectorError {
    pub(crate) fn poll(target_url: &str, reason: impl ToString) -> Self {
        Self::Poll {
            target_url: target_url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn stream(target_url: &str, batch_id: u64, reason: impl ToString) -> Self {
        Self::Stream {
            target_url: target_url.to_string(),
            batch_id,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}
