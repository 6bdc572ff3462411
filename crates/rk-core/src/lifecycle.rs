//! Application lifecycle signals.
//!
//! The host translates its platform's lifecycle notifications into
//! [`LifecycleSignal`]s and emits them on a [`LifecycleBus`]. Observers are
//! called synchronously, in registration order, on the emitting thread, so a
//! `WillTerminate` handler has finished its work when `emit` returns.

use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::Component;

/// Lifecycle transition of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum LifecycleSignal {
    EnteredBackground { at: DateTime<Utc> },
    EnteredForeground,
    WillTerminate,
}

/// Receives lifecycle signals.
pub trait LifecycleObserver: Send + Sync {
    fn on_lifecycle(&self, signal: LifecycleSignal);
}

/// Broadcasts lifecycle signals to observers and channel subscribers.
///
/// Observers are held weakly; dropping an observer unregisters it.
#[derive(Default)]
pub struct LifecycleBus {
    observers: Mutex<Vec<Weak<dyn LifecycleObserver>>>,
    senders: Mutex<Vec<mpsc::Sender<LifecycleSignal>>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O: LifecycleObserver + 'static>(&self, observer: &Arc<O>) {
        let weak: Weak<dyn LifecycleObserver> = Arc::downgrade(observer) as Weak<dyn LifecycleObserver>;
        lock(&self.observers).push(weak);
    }

    /// Subscribe to receive lifecycle signals.
    pub fn subscribe(&self) -> mpsc::Receiver<LifecycleSignal> {
        let (tx, rx) = mpsc::channel();
        lock(&self.senders).push(tx);
        rx
    }

    /// Deliver `signal` to every live observer, then to subscribers.
    pub fn emit(&self, signal: LifecycleSignal) {
        let observers: Vec<Arc<dyn LifecycleObserver>> = {
            let mut observers = lock(&self.observers);
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        debug!(
            component = %Component::Lifecycle,
            signal = ?signal,
            observers = observers.len(),
            "lifecycle signal"
        );
        for observer in observers {
            observer.on_lifecycle(signal);
        }

        lock(&self.senders).retain(|sender| sender.send(signal).is_ok());
    }

    pub fn entered_background(&self, at: DateTime<Utc>) {
        self.emit(LifecycleSignal::EnteredBackground { at });
    }

    pub fn entered_foreground(&self) {
        self.emit(LifecycleSignal::EnteredForeground);
    }

    pub fn will_terminate(&self) {
        self.emit(LifecycleSignal::WillTerminate);
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers)
            .iter()
            .filter(|o| o.strong_count() > 0)
            .count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
