//! Upload transport seam.
//!
//! A transport accepts scheduled [`UploadTask`]s, performs them no earlier
//! than their `earliest_begin` and reports every task's fate exactly once
//! through the completion handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::descriptor::{attempt_deadline, PendingRequest};

/// Errors from performing or scheduling an upload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request body {0} is missing")]
    MissingBody(String),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("transport is shut down")]
    ShutDown,

    #[error("failed to start transport worker: {0}")]
    Worker(String),
}

impl TransportError {
    /// Whether another attempt can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Body(_))
    }
}

impl From<TransportError> for rk_common::Error {
    fn from(err: TransportError) -> Self {
        rk_common::Error::Transport(err.to_string())
    }
}

/// One scheduled delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    /// Descriptor as of this attempt (send count already incremented).
    pub descriptor: PendingRequest,
    /// `None` means the attempt may start at once.
    pub earliest_begin: Option<DateTime<Utc>>,
}

impl UploadTask {
    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    /// A task without a start time, or one that should have finished by
    /// `now`, is considered stalled.
    pub fn is_stalled_at(&self, now: DateTime<Utc>) -> bool {
        match self.earliest_begin {
            None => true,
            Some(begin) => attempt_deadline(begin, self.descriptor.timeout())
                .is_some_and(|deadline| deadline < now),
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// The collector answered. Any status counts as a round trip.
    Completed { status: u16, body: Option<String> },
    /// No answer. Retried.
    Failed(TransportError),
    /// Withdrawn via [`UploadTransport::cancel`].
    Cancelled,
}

impl TransportOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransportOutcome::Completed { status, .. } if (200..300).contains(status))
    }
}

/// Called once per submitted task with the descriptor it carried.
pub type CompletionHandler = Arc<dyn Fn(PendingRequest, TransportOutcome) + Send + Sync>;

/// Performs scheduled uploads.
pub trait UploadTransport: Send + Sync {
    /// Queue a task. Returns once the task is accepted, not performed.
    fn submit(&self, task: UploadTask) -> Result<(), TransportError>;

    /// Tasks accepted but not yet reported, including one in flight.
    fn outstanding(&self) -> Vec<UploadTask>;

    /// Withdraw a queued task. Returns `false` when the task is unknown or
    /// already in flight. A withdrawn task is reported as
    /// [`TransportOutcome::Cancelled`].
    fn cancel(&self, id: Uuid) -> bool;

    fn set_completion_handler(&self, handler: CompletionHandler);

    /// Stop performing tasks. Queued tasks are abandoned without a report.
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn task(earliest_begin: Option<DateTime<Utc>>) -> UploadTask {
        UploadTask {
            descriptor: PendingRequest::new(
                Uuid::new_v4(),
                "https://c",
                Duration::from_secs(30),
                BTreeMap::new(),
                Utc::now(),
            ),
            earliest_begin,
        }
    }

    #[test]
    fn test_task_without_begin_is_stalled() {
        assert!(task(None).is_stalled_at(Utc::now()));
    }

    #[test]
    fn test_task_stalled_only_after_timeout() {
        let now = Utc::now();
        assert!(!task(Some(now - chrono::Duration::seconds(29))).is_stalled_at(now));
        assert!(task(Some(now - chrono::Duration::seconds(31))).is_stalled_at(now));
        // Future tasks are waiting, not stalled.
        assert!(!task(Some(now + chrono::Duration::minutes(10))).is_stalled_at(now));
    }

    #[test]
    fn test_outcome_success() {
        assert!(TransportOutcome::Completed {
            status: 204,
            body: None
        }
        .is_success());
        assert!(!TransportOutcome::Completed {
            status: 503,
            body: None
        }
        .is_success());
        assert!(!TransportOutcome::Cancelled.is_success());
    }
}
