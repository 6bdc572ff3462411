//! Blocking HTTP transport on a dedicated scheduler thread.
//!
//! Tasks wait in a queue until their `earliest_begin`; the worker performs
//! one POST at a time with `ureq` and hands the outcome to the completion
//! handler. Any HTTP status is a completed round trip; only a missing
//! answer (DNS, connect, timeout) is a failure.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rk_common::SharedClock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::descriptor::PendingRequest;
use crate::transport::{
    CompletionHandler, TransportError, TransportOutcome, UploadTask, UploadTransport,
};

/// Upper bound on a single idle wait, so clock jumps are noticed.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Static request settings.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub user_agent: String,
    pub content_type: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("rumkit/{}", env!("CARGO_PKG_VERSION")),
            content_type: "application/json".to_string(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: Vec<UploadTask>,
    in_flight: Option<UploadTask>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    handler: Mutex<Option<CompletionHandler>>,
    blobs: Arc<dyn BlobStore>,
    agent: ureq::Agent,
    config: HttpTransportConfig,
    clock: SharedClock,
}

/// `ureq`-backed [`UploadTransport`].
pub struct HttpTransport {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl HttpTransport {
    /// Start the `rk-upload` worker thread.
    pub fn start(
        blobs: Arc<dyn BlobStore>,
        clock: SharedClock,
        config: HttpTransportConfig,
    ) -> Result<Self, TransportError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            handler: Mutex::new(None),
            blobs,
            agent,
            config,
            clock,
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("rk-upload".to_string())
            .spawn(move || run_worker(worker_shared))
            .map_err(|e| TransportError::Worker(e.to_string()))?;

        debug!("http transport started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl UploadTransport for HttpTransport {
    fn submit(&self, task: UploadTask) -> Result<(), TransportError> {
        let mut state = self.shared.lock_queue();
        if state.shutdown {
            return Err(TransportError::ShutDown);
        }
        let id = task.id();
        state.pending.retain(|t| t.id() != id);
        debug!(
            request_id = %id,
            sent_count = task.descriptor.sent_count,
            earliest_begin = ?task.earliest_begin,
            "upload task queued"
        );
        state.pending.push(task);
        drop(state);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn outstanding(&self) -> Vec<UploadTask> {
        let state = self.shared.lock_queue();
        let mut tasks = state.pending.clone();
        if let Some(task) = &state.in_flight {
            tasks.push(task.clone());
        }
        tasks
    }

    fn cancel(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = self.shared.lock_queue();
            match state.pending.iter().position(|t| t.id() == id) {
                Some(idx) => Some(state.pending.remove(idx)),
                None => None,
            }
        };
        match removed {
            Some(task) => {
                debug!(request_id = %id, "upload task cancelled");
                self.shared
                    .report(task.descriptor, TransportOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    fn set_completion_handler(&self, handler: CompletionHandler) {
        match self.shared.handler.lock() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.shared.lock_queue();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            if !state.pending.is_empty() {
                info!(
                    abandoned = state.pending.len(),
                    "http transport stopping with queued uploads"
                );
            }
        }
        self.shared.wake.notify_all();

        let handle = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            // The completion handler runs on the worker; it must not join itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("http transport stopped");
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn report(&self, descriptor: PendingRequest, outcome: TransportOutcome) {
        let handler = match self.handler.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match handler {
            Some(handler) => handler(descriptor, outcome),
            None => debug!(request_id = %descriptor.id, outcome = ?outcome, "no completion handler"),
        }
    }

    fn perform(&self, task: &UploadTask) -> TransportOutcome {
        let descriptor = &task.descriptor;
        let body = match self.blobs.read(&descriptor.blob_key) {
            Ok(Some(body)) => body,
            Ok(None) => {
                return TransportOutcome::Failed(TransportError::MissingBody(
                    descriptor.blob_key.clone(),
                ))
            }
            Err(e) => return TransportOutcome::Failed(TransportError::Body(e.to_string())),
        };

        let mut request = self
            .agent
            .post(&descriptor.endpoint)
            .set("Content-Type", &self.config.content_type)
            .set("User-Agent", &self.config.user_agent);
        let timeout = descriptor.timeout();
        if !timeout.is_zero() {
            request = request.timeout(timeout);
        }
        for (name, value) in &descriptor.headers {
            request = request.set(name, value);
        }

        debug!(
            request_id = %descriptor.id,
            endpoint = %descriptor.endpoint,
            bytes = body.len(),
            attempt = descriptor.sent_count,
            "upload started"
        );

        match request.send_bytes(&body) {
            Ok(response) => TransportOutcome::Completed {
                status: response.status(),
                body: None,
            },
            Err(ureq::Error::Status(status, response)) => TransportOutcome::Completed {
                status,
                body: response.into_string().ok(),
            },
            Err(ureq::Error::Transport(e)) => {
                warn!(request_id = %descriptor.id, error = %e, "upload failed");
                TransportOutcome::Failed(TransportError::Network(e.to_string()))
            }
        }
    }
}

enum Next {
    Ready(usize),
    Wait(Duration),
    Idle,
}

/// Pick the earliest task. Tasks without a begin time go first.
fn next_due(pending: &[UploadTask], now: DateTime<Utc>) -> Next {
    let earliest = pending
        .iter()
        .enumerate()
        .min_by_key(|(_, t)| t.earliest_begin.unwrap_or(DateTime::<Utc>::MIN_UTC));
    match earliest {
        None => Next::Idle,
        Some((idx, task)) => match task.earliest_begin {
            Some(begin) if begin > now => {
                Next::Wait((begin - now).to_std().unwrap_or(Duration::ZERO))
            }
            _ => Next::Ready(idx),
        },
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.lock_queue();
            loop {
                if state.shutdown {
                    return;
                }
                let wait = match next_due(&state.pending, shared.clock.now()) {
                    Next::Ready(idx) => {
                        let task = state.pending.remove(idx);
                        state.in_flight = Some(task.clone());
                        break task;
                    }
                    Next::Wait(d) => d.min(MAX_IDLE_WAIT),
                    Next::Idle => MAX_IDLE_WAIT,
                };
                state = match shared.wake.wait_timeout(state, wait) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
        };

        let outcome = shared.perform(&task);
        shared.lock_queue().in_flight = None;
        shared.report(task.descriptor, outcome);
    }
}
