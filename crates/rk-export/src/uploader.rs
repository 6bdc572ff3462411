//! Durable upload queue with backoff and stall recovery.
//!
//! Every upload is first made durable (blob + pending index entry), then
//! scheduled on the transport. Delivery is at-least-once:
//!
//! - a failed attempt is rescheduled with the next backoff delay
//! - any collector answer removes the blob and its index entry
//! - after the retry ceiling the upload is dropped
//! - after a restart, [`RetryingUploader::recover_stalled`] rebuilds the
//!   transport queue from the blobs on disk

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rk_cache::{CacheError, CachePolicy, KeyValueStore, PersistentCache, StoreError};
use rk_common::{AgentConfig, SharedClock};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::{BlobStats, BlobStore};
use crate::descriptor::{PendingRequest, DEFAULT_RETRY_CEILING};
use crate::transport::{TransportError, TransportOutcome, UploadTask, UploadTransport};

/// Key of the pending-request index in the key/value store.
pub const INDEX_CACHE_NAME: &str = "uploads";

/// Recovery runs this long after start-up, give or take.
pub const RECOVERY_DELAY_MS: std::ops::RangeInclusive<u64> = 5_000..=8_000;

/// Errors from the upload queue.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("blob store: {0}")]
    Blob(#[from] StoreError),

    #[error("pending index: {0}")]
    Index(#[from] CacheError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("uploader is shut down")]
    ShutDown,

    #[error("failed to start recovery thread: {0}")]
    Worker(String),
}

impl From<ExportError> for rk_common::Error {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::Blob(e) => rk_common::Error::Storage(e.to_string()),
            ExportError::Index(e) => e.into(),
            ExportError::Transport(e) => e.into(),
            other => rk_common::Error::Transport(other.to_string()),
        }
    }
}

/// Where and how uploads are sent.
#[derive(Debug, Clone, PartialEq)]
pub struct UploaderConfig {
    pub endpoint: String,
    pub retry_ceiling: u32,
    pub request_timeout: Duration,
    /// Sent with every request; per-upload headers take precedence.
    pub headers: BTreeMap<String, String>,
}

impl UploaderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            request_timeout: Duration::from_secs(30),
            headers: BTreeMap::new(),
        }
    }

    /// `None` when the agent has no endpoint.
    pub fn from_agent_config(config: &AgentConfig) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;
        Some(Self {
            endpoint,
            retry_ceiling: config.upload_retry_ceiling,
            request_timeout: config.request_timeout(),
            headers: config.headers.clone(),
        })
    }
}

/// What [`RetryingUploader::send`] did with a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Submitted,
    /// Over the retry ceiling; blob and index entry removed.
    Dropped,
    /// Blob gone; index entry removed.
    MissingBlob,
}

/// Counts from one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stalled transport tasks withdrawn.
    pub cancelled: usize,
    /// Withdrawn tasks sent again.
    pub resubmitted: usize,
    /// Index entries put back on the transport.
    pub restored: usize,
    /// Blobs without an index entry given a fresh descriptor.
    pub created: usize,
    /// Blobs with a live transport task.
    pub live: usize,
    /// Files in the blob store that are not upload ids.
    pub ignored: usize,
    /// Index entries whose blob was gone.
    pub orphaned: usize,
}

struct RecoveryJob {
    cancel: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

struct UploaderInner {
    config: UploaderConfig,
    blobs: Arc<dyn BlobStore>,
    index: PersistentCache<PendingRequest>,
    transport: Arc<dyn UploadTransport>,
    clock: SharedClock,
    shut_down: AtomicBool,
    /// Held by an upload from blob write to first submit, and by a whole
    /// recovery pass, so recovery never sees a half-enqueued upload.
    submit_gate: Mutex<()>,
}

/// Durable, retrying upload queue.
pub struct RetryingUploader {
    inner: Arc<UploaderInner>,
    recovery: Mutex<Option<RecoveryJob>>,
}

impl RetryingUploader {
    /// Open the pending index and attach to `transport`.
    ///
    /// Nothing is resubmitted here; call [`Self::schedule_recovery`] (or
    /// [`Self::recover_stalled`]) to pick up uploads from a previous run.
    pub fn new(
        config: UploaderConfig,
        blobs: Arc<dyn BlobStore>,
        index_store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn UploadTransport>,
        clock: SharedClock,
    ) -> Result<Self, ExportError> {
        let index = PersistentCache::open(
            INDEX_CACHE_NAME,
            index_store,
            clock.clone(),
            CachePolicy::unbounded(),
        )?;

        let inner = Arc::new(UploaderInner {
            config,
            blobs,
            index,
            transport,
            clock,
            shut_down: AtomicBool::new(false),
            submit_gate: Mutex::new(()),
        });

        let weak: Weak<UploaderInner> = Arc::downgrade(&inner);
        inner
            .transport
            .set_completion_handler(Arc::new(move |descriptor, outcome| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_completion(descriptor, outcome);
                }
            }));

        info!(
            endpoint = %inner.config.endpoint,
            pending = inner.index.len(),
            "uploader ready"
        );

        Ok(Self {
            inner,
            recovery: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    /// Durably enqueue `payload` and schedule its first attempt.
    ///
    /// `Ok` means the payload is on disk and will be delivered or dropped by
    /// the retry policy, even if scheduling it failed right now.
    pub fn upload(
        &self,
        payload: &[u8],
        headers: BTreeMap<String, String>,
    ) -> Result<Uuid, ExportError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ExportError::ShutDown);
        }

        let id = Uuid::new_v4();
        let key = id.to_string();
        let _gate = self.inner.lock_submit_gate();
        self.inner.blobs.write(&key, payload)?;

        let mut merged = self.inner.config.headers.clone();
        merged.extend(headers);
        let descriptor = PendingRequest::new(
            id,
            self.inner.config.endpoint.clone(),
            self.inner.config.request_timeout,
            merged,
            self.inner.clock.now(),
        );

        if let Err(e) = self.inner.index.update(descriptor.clone(), &key) {
            if let Err(cleanup) = self.inner.blobs.delete(&key) {
                warn!(request_id = %id, error = %cleanup, "failed to remove blob after index failure");
            }
            return Err(e.into());
        }

        debug!(request_id = %id, bytes = payload.len(), "upload enqueued");

        if let Err(e) = self.inner.send(descriptor) {
            warn!(request_id = %id, error = %e, "upload stored but not scheduled");
        }
        Ok(id)
    }

    /// Schedule the next attempt for `descriptor`.
    pub fn send(&self, descriptor: PendingRequest) -> Result<SendOutcome, ExportError> {
        self.inner.send(descriptor)
    }

    /// React to a finished attempt.
    pub fn handle_completion(&self, descriptor: PendingRequest, outcome: TransportOutcome) {
        self.inner.handle_completion(descriptor, outcome);
    }

    /// Withdraw stalled transport tasks and reschedule every blob that has
    /// no live task.
    pub fn recover_stalled(&self, now: DateTime<Utc>) -> Result<RecoveryReport, ExportError> {
        self.inner.recover_stalled(now)
    }

    /// Run [`Self::recover_stalled`] once after a random 5-8 s delay.
    pub fn schedule_recovery(&self) -> Result<(), ExportError> {
        let delay_ms = rand::rng().random_range(RECOVERY_DELAY_MS);
        self.schedule_recovery_after(Duration::from_millis(delay_ms))
    }

    /// Run [`Self::recover_stalled`] once after `delay` on the
    /// `rk-upload-recovery` thread. Replaces any recovery still waiting.
    pub fn schedule_recovery_after(&self, delay: Duration) -> Result<(), ExportError> {
        self.cancel_recovery();

        let (cancel, cancelled) = mpsc::channel::<()>();
        let weak = Arc::downgrade(&self.inner);
        let handle = thread::Builder::new()
            .name("rk-upload-recovery".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(delay) {
                    let Some(inner) = weak.upgrade() else { return };
                    let now = inner.clock.now();
                    match inner.recover_stalled(now) {
                        Ok(report) => info!(?report, "upload recovery finished"),
                        Err(e) => warn!(error = %e, "upload recovery failed"),
                    }
                }
            })
            .map_err(|e| ExportError::Worker(e.to_string()))?;

        debug!(delay_ms = delay.as_millis() as u64, "upload recovery scheduled");
        let mut slot = match self.recovery.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(RecoveryJob { cancel, handle });
        Ok(())
    }

    /// Stop a pending recovery. No-op if none is waiting.
    pub fn cancel_recovery(&self) {
        let job = match self.recovery.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(job) = job {
            let _ = job.cancel.send(());
            let _ = job.handle.join();
        }
    }

    /// Pending requests ordered by scheduled time.
    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut pending = self.inner.index.values();
        pending.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        pending
    }

    pub fn stats(&self) -> Result<BlobStats, ExportError> {
        Ok(self.inner.blobs.stats()?)
    }

    /// Stop accepting uploads, cancel recovery and stop the transport.
    /// Queued uploads stay on disk for the next run.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_recovery();
        self.inner.transport.shutdown();
        info!(pending = self.inner.index.len(), "uploader shut down");
    }
}

impl Drop for RetryingUploader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl UploaderInner {
    fn send(&self, descriptor: PendingRequest) -> Result<SendOutcome, ExportError> {
        let key = descriptor.id.to_string();

        if !descriptor.should_send(self.config.retry_ceiling) {
            info!(
                request_id = %descriptor.id,
                sent_count = descriptor.sent_count,
                ceiling = self.config.retry_ceiling,
                "retry ceiling exceeded, dropping upload"
            );
            self.discard(&descriptor);
            return Ok(SendOutcome::Dropped);
        }

        if !self.blobs.exists(&descriptor.blob_key)? {
            error!(request_id = %descriptor.id, blob = %descriptor.blob_key, "upload body missing");
            self.index.remove(&key)?;
            return Ok(SendOutcome::MissingBlob);
        }

        let attempt = descriptor.attempt(self.clock.now());
        if let Err(e) = self.index.update(attempt.clone(), &key) {
            warn!(request_id = %descriptor.id, error = %e, "failed to persist attempt");
        }

        debug!(
            request_id = %attempt.id,
            attempt = attempt.sent_count,
            earliest_begin = %attempt.scheduled_at,
            "upload scheduled"
        );
        self.transport.submit(UploadTask {
            earliest_begin: Some(attempt.scheduled_at),
            descriptor: attempt,
        })?;
        Ok(SendOutcome::Submitted)
    }

    fn handle_completion(&self, descriptor: PendingRequest, outcome: TransportOutcome) {
        match outcome {
            TransportOutcome::Completed { status, body } => {
                if (200..300).contains(&status) {
                    debug!(request_id = %descriptor.id, status, "upload delivered");
                } else {
                    info!(
                        request_id = %descriptor.id,
                        endpoint = %descriptor.endpoint,
                        status,
                        body = body.as_deref().unwrap_or(""),
                        "collector rejected upload"
                    );
                }
                self.discard(&descriptor);
            }
            TransportOutcome::Failed(err) => {
                info!(
                    request_id = %descriptor.id,
                    endpoint = %descriptor.endpoint,
                    attempt = descriptor.sent_count,
                    error = %err,
                    "upload attempt failed"
                );
                if let Err(e) = self.send(descriptor) {
                    warn!(error = %e, "failed to reschedule upload");
                }
            }
            TransportOutcome::Cancelled => {
                debug!(request_id = %descriptor.id, "upload cancelled");
            }
        }
    }

    fn discard(&self, descriptor: &PendingRequest) {
        if let Err(e) = self.blobs.delete(&descriptor.blob_key) {
            warn!(request_id = %descriptor.id, error = %e, "failed to delete upload body");
        }
        if let Err(e) = self.index.remove(&descriptor.id.to_string()) {
            warn!(request_id = %descriptor.id, error = %e, "failed to delete pending entry");
        }
    }

    fn lock_submit_gate(&self) -> MutexGuard<'_, ()> {
        match self.submit_gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn recover_stalled(&self, now: DateTime<Utc>) -> Result<RecoveryReport, ExportError> {
        let _gate = self.lock_submit_gate();
        let mut report = RecoveryReport::default();

        // Phase 1: withdraw stalled tasks
        let mut live: HashSet<Uuid> = HashSet::new();
        let mut stalled: HashMap<Uuid, PendingRequest> = HashMap::new();
        for task in self.transport.outstanding() {
            let id = task.id();
            if task.is_stalled_at(now) && self.transport.cancel(id) {
                report.cancelled += 1;
                stalled.insert(id, task.descriptor);
            } else {
                live.insert(id);
            }
        }

        // Phase 2: every blob without a live task gets one
        for name in self.blobs.list()? {
            let Ok(id) = Uuid::parse_str(&name) else {
                report.ignored += 1;
                continue;
            };
            if live.contains(&id) {
                report.live += 1;
                continue;
            }
            if let Some(descriptor) = stalled.remove(&id) {
                self.send(descriptor)?;
                report.resubmitted += 1;
                continue;
            }
            match self.index.value_for_key(&id.to_string()) {
                Some(entry) => {
                    // Same attempt as before the restart; keep its schedule.
                    let begin = entry.scheduled_at.max(now);
                    self.transport.submit(UploadTask {
                        descriptor: entry,
                        earliest_begin: Some(begin),
                    })?;
                    report.restored += 1;
                }
                None => {
                    let mut descriptor = PendingRequest::new(
                        id,
                        self.config.endpoint.clone(),
                        self.config.request_timeout,
                        self.config.headers.clone(),
                        now,
                    );
                    descriptor.blob_key = name.clone();
                    self.index.update(descriptor.clone(), &id.to_string())?;
                    self.send(descriptor)?;
                    report.created += 1;
                }
            }
        }

        // Phase 3: forget index entries whose blob is gone
        for key in self.index.keys() {
            let Some(entry) = self.index.value_for_key(&key) else { continue };
            if live.contains(&entry.id) {
                continue;
            }
            if !self.blobs.exists(&entry.blob_key)? {
                self.index.remove(&key)?;
                report.orphaned += 1;
            }
        }

        debug!(?report, "stall scan complete");
        Ok(report)
    }
}
