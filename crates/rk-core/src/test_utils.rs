//! Test utilities for rk-core.
//!
//! - [`RecordingSink`]: an [`EventSink`] that keeps every event it accepts
//! - [`MemorySource`]: an [`EventSource`] that records deletions
//! - [`wait_until`]: polling helper for thread-driven tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::pipeline::{EventMetadata, EventSink, EventSource, PipelineError, WireEvent};

/// Sink that decodes and keeps accepted events.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(WireEvent, BTreeMap<String, String>)>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingSink {
    /// Refuse every submission while set.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every submission.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn events(&self) -> Vec<WireEvent> {
        lock(&self.events).iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn events_named(&self, name: &str) -> Vec<WireEvent> {
        self.events().into_iter().filter(|e| e.name == name).collect()
    }

    pub fn headers(&self) -> Vec<BTreeMap<String, String>> {
        lock(&self.events).iter().map(|(_, h)| h.clone()).collect()
    }
}

impl EventSink for RecordingSink {
    fn submit(
        &self,
        payload: &[u8],
        headers: BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::Export(rk_export::ExportError::ShutDown));
        }
        let event: WireEvent = serde_json::from_slice(payload)?;
        lock(&self.events).push((event, headers));
        Ok(())
    }
}

/// Event source whose deletions can be inspected.
#[derive(Default)]
pub struct MemorySource {
    deleted: Mutex<Vec<EventMetadata>>,
}

impl MemorySource {
    pub fn deleted(&self) -> Vec<EventMetadata> {
        lock(&self.deleted).clone()
    }
}

impl EventSource for MemorySource {
    fn delete_data(&self, metadata: &EventMetadata) -> rk_common::Result<()> {
        lock(&self.deleted).push(metadata.clone());
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
