//! rumkit export subsystem.
//!
//! Events are written to a [`BlobStore`], indexed as [`PendingRequest`]s and
//! delivered by an [`UploadTransport`] under the control of the
//! [`RetryingUploader`], which retries with backoff and recovers uploads left
//! over from previous runs.

pub mod blob;
pub mod descriptor;
pub mod http;
pub mod transport;
pub mod uploader;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use blob::{BlobStats, BlobStore, FsBlobStore, MemoryBlobStore};
pub use descriptor::{backoff_delay, PendingRequest, DEFAULT_RETRY_CEILING};
pub use http::{HttpTransport, HttpTransportConfig};
pub use transport::{
    CompletionHandler, TransportError, TransportOutcome, UploadTask, UploadTransport,
};
pub use uploader::{
    ExportError, RecoveryReport, RetryingUploader, SendOutcome, UploaderConfig, INDEX_CACHE_NAME,
};
