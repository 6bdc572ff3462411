//! Where serialized events go.

use std::collections::BTreeMap;

use rk_export::RetryingUploader;

use super::PipelineError;

/// Durable handoff of one serialized event.
///
/// `Ok` means the event will be delivered or dropped by the export retry
/// policy; the caller no longer owns it.
pub trait EventSink: Send + Sync {
    fn submit(
        &self,
        payload: &[u8],
        headers: BTreeMap<String, String>,
    ) -> Result<(), PipelineError>;
}

impl EventSink for RetryingUploader {
    fn submit(
        &self,
        payload: &[u8],
        headers: BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        self.upload(payload, headers)?;
        Ok(())
    }
}

/// Sink used when no endpoint is configured. Accepts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn submit(
        &self,
        _payload: &[u8],
        _headers: BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        Err(PipelineError::NoEndpoint)
    }
}
