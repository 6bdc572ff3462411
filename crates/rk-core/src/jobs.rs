//! Periodic background jobs.
//!
//! A [`RepeatingJob`] runs a closure every `interval` on its own named
//! thread. The thread waits on a control channel with `recv_timeout`, so
//! stopping is immediate and never waits out an interval.
//!
//! A [`LifecycleRepeatingJob`] additionally follows the app lifecycle: on
//! entering the background it runs once more and suspends; on returning to
//! the foreground it resumes and runs once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::lifecycle::{LifecycleObserver, LifecycleSignal};
use crate::logging::{event_names, Component};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("failed to spawn job thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

type JobFn = Arc<dyn Fn() + Send + Sync>;

enum Control {
    Stop,
    FireNow,
}

struct Worker {
    control: mpsc::Sender<Control>,
    handle: thread::JoinHandle<()>,
}

/// Runs a closure periodically on a dedicated thread.
pub struct RepeatingJob {
    name: String,
    interval: Duration,
    task: JobFn,
    worker: Mutex<Option<Worker>>,
}

impl RepeatingJob {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            task: Arc::new(task),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start ticking. The first run happens one interval from now.
    /// Starting a running job is a no-op.
    pub fn start(&self) -> Result<(), JobError> {
        let mut slot = self.lock_worker();
        if slot.is_some() {
            return Ok(());
        }

        let (control, commands) = mpsc::channel();
        let task = self.task.clone();
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || loop {
                match commands.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) | Ok(Control::FireNow) => task(),
                    Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|source| JobError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        *slot = Some(Worker { control, handle });
        debug!(
            component = %Component::Jobs,
            event = event_names::JOB_STARTED,
            job = %self.name,
            interval_ms = self.interval.as_millis() as u64,
            "job started"
        );
        Ok(())
    }

    /// Stop ticking and wait for a run in progress. Stopping a stopped job
    /// is a no-op.
    pub fn stop(&self) {
        let worker = self.lock_worker().take();
        let Some(worker) = worker else { return };
        let _ = worker.control.send(Control::Stop);
        // A job may stop itself from inside its own closure.
        if worker.handle.thread().id() != thread::current().id() {
            let _ = worker.handle.join();
        }
        debug!(
            component = %Component::Jobs,
            event = event_names::JOB_STOPPED,
            job = %self.name,
            "job stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().is_some()
    }

    /// Run the closure on the calling thread.
    pub fn run_once(&self) {
        (self.task)();
    }

    /// Ask the running worker to run now. Returns `false` if not running.
    pub fn fire(&self) -> bool {
        match self.lock_worker().as_ref() {
            Some(worker) => worker.control.send(Control::FireNow).is_ok(),
            None => false,
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for RepeatingJob {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A [`RepeatingJob`] that suspends while the app is in the background.
///
/// Explicit `start`/`stop` calls made while suspended by the lifecycle are
/// ignored; the lifecycle owns the job until the next foreground.
pub struct LifecycleRepeatingJob {
    job: RepeatingJob,
    suspended_by_lifecycle: AtomicBool,
}

impl LifecycleRepeatingJob {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            job: RepeatingJob::new(name, interval, task),
            suspended_by_lifecycle: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<(), JobError> {
        if self.is_suspended_by_lifecycle() {
            return Ok(());
        }
        self.job.start()
    }

    pub fn stop(&self) {
        if self.is_suspended_by_lifecycle() {
            return;
        }
        self.job.stop();
    }

    /// Stop for good, whoever suspended the job.
    pub fn shutdown(&self) {
        self.suspended_by_lifecycle.store(false, Ordering::SeqCst);
        self.job.stop();
    }

    pub fn is_running(&self) -> bool {
        self.job.is_running()
    }

    pub fn is_suspended_by_lifecycle(&self) -> bool {
        self.suspended_by_lifecycle.load(Ordering::SeqCst)
    }

    /// Final run and suspend. Only a running job is suspended.
    pub fn entered_background(&self) {
        if !self.job.is_running() {
            return;
        }
        self.job.stop();
        self.suspended_by_lifecycle.store(true, Ordering::SeqCst);
        debug!(
            component = %Component::Jobs,
            event = event_names::JOB_SUSPENDED,
            job = %self.job.name(),
            "job suspended for background"
        );
        self.job.run_once();
    }

    /// Resume and run once. Only a job suspended by the lifecycle resumes.
    pub fn entered_foreground(&self) {
        if !self.suspended_by_lifecycle.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.job.start() {
            warn!(
                component = %Component::Jobs,
                job = %self.job.name(),
                error = %e,
                "failed to resume job"
            );
            return;
        }
        debug!(
            component = %Component::Jobs,
            event = event_names::JOB_RESUMED,
            job = %self.job.name(),
            "job resumed"
        );
        self.job.run_once();
    }
}

impl LifecycleObserver for LifecycleRepeatingJob {
    fn on_lifecycle(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::EnteredBackground { .. } => self.entered_background(),
            LifecycleSignal::EnteredForeground => self.entered_foreground(),
            LifecycleSignal::WillTerminate => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_for(count: &AtomicUsize, at_least: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_job_ticks_until_stopped() {
        let (count, task) = counter();
        let job = RepeatingJob::new("rk-test-tick", Duration::from_millis(10), task);
        job.start().unwrap();
        assert!(wait_for(&count, 3));

        job.stop();
        assert!(!job.is_running());
        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (_, task) = counter();
        let job = RepeatingJob::new("rk-test-idem", Duration::from_secs(60), task);
        job.start().unwrap();
        job.start().unwrap();
        assert!(job.is_running());
        job.stop();
        job.stop();
        assert!(!job.is_running());
    }

    #[test]
    fn test_stop_does_not_wait_for_interval() {
        let (_, task) = counter();
        let job = RepeatingJob::new("rk-test-fast-stop", Duration::from_secs(3600), task);
        job.start().unwrap();
        let started = Instant::now();
        job.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_fire_runs_immediately() {
        let (count, task) = counter();
        let job = RepeatingJob::new("rk-test-fire", Duration::from_secs(3600), task);
        assert!(!job.fire());
        job.start().unwrap();
        assert!(job.fire());
        assert!(wait_for(&count, 1));
    }

    #[test]
    fn test_lifecycle_job_background_runs_once_and_suspends() {
        let (count, task) = counter();
        let job = LifecycleRepeatingJob::new("rk-test-pulse", Duration::from_secs(3600), task);
        job.start().unwrap();

        job.on_lifecycle(LifecycleSignal::EnteredBackground {
            at: chrono::Utc::now(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!job.is_running());
        assert!(job.is_suspended_by_lifecycle());

        // Explicit start is ignored while suspended by the lifecycle.
        job.start().unwrap();
        assert!(!job.is_running());

        job.on_lifecycle(LifecycleSignal::EnteredForeground);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(job.is_running());
        assert!(!job.is_suspended_by_lifecycle());
        job.stop();
    }

    #[test]
    fn test_lifecycle_job_not_started_ignores_signals() {
        let (count, task) = counter();
        let job = LifecycleRepeatingJob::new("rk-test-idle", Duration::from_secs(3600), task);

        job.entered_background();
        job.entered_foreground();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!job.is_running());
    }
}
