//! Test utilities for rk-export.
//!
//! [`ManualTransport`] records submitted tasks and only completes them when
//! a test says so, which makes retry schedules observable step by step.

use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::descriptor::PendingRequest;
use crate::transport::{
    CompletionHandler, TransportError, TransportOutcome, UploadTask, UploadTransport,
};

#[derive(Default)]
struct ManualState {
    queued: Vec<UploadTask>,
    history: Vec<UploadTask>,
    refuse: bool,
}

/// Transport driven entirely by the test.
#[derive(Default)]
pub struct ManualTransport {
    state: Mutex<ManualState>,
    handler: Mutex<Option<CompletionHandler>>,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every task ever submitted, in order.
    pub fn history(&self) -> Vec<UploadTask> {
        self.lock().history.clone()
    }

    /// Tasks submitted and not yet completed or cancelled.
    pub fn queued(&self) -> Vec<UploadTask> {
        self.lock().queued.clone()
    }

    /// Make `submit` fail as if the transport were shut down.
    pub fn set_refuse(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Put a task in the queue without recording it, as if it survived
    /// from an earlier run.
    pub fn seed(&self, task: UploadTask) {
        self.lock().queued.push(task);
    }

    /// Complete the oldest queued task. Returns its descriptor.
    pub fn complete_next(&self, outcome: TransportOutcome) -> Option<PendingRequest> {
        let task = {
            let mut state = self.lock();
            if state.queued.is_empty() {
                return None;
            }
            state.queued.remove(0)
        };
        self.report(task.descriptor.clone(), outcome);
        Some(task.descriptor)
    }

    fn report(&self, descriptor: PendingRequest, outcome: TransportOutcome) {
        let handler = match self.handler.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(handler) = handler {
            handler(descriptor, outcome);
        }
    }
}

impl UploadTransport for ManualTransport {
    fn submit(&self, task: UploadTask) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.refuse {
            return Err(TransportError::ShutDown);
        }
        state.history.push(task.clone());
        state.queued.push(task);
        Ok(())
    }

    fn outstanding(&self) -> Vec<UploadTask> {
        self.queued()
    }

    fn cancel(&self, id: Uuid) -> bool {
        let task = {
            let mut state = self.lock();
            match state.queued.iter().position(|t| t.id() == id) {
                Some(idx) => state.queued.remove(idx),
                None => return false,
            }
        };
        self.report(task.descriptor, TransportOutcome::Cancelled);
        true
    }

    fn set_completion_handler(&self, handler: CompletionHandler) {
        match self.handler.lock() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }
}
