//! App-not-responding watchdog.
//!
//! Two periodic tasks share one flag. The heartbeat runs on the host's main
//! context and sets the flag; the detection check runs on the
//! `rk-anr-detect` thread, reads and clears it, and feeds the result to an
//! [`AnrDetector`]. A stall is any run of checks with no beat in between.
//!
//! The flag is read and cleared with two relaxed operations rather than a
//! swap. A beat landing between them is lost and shows up as at most one
//! extra check period of stall, which the thresholds tolerate.

mod detector;

pub use detector::{AnrDetector, AnrReport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rk_common::AgentConfig;
use tracing::{debug, info, trace, warn};

use crate::jobs::{JobError, RepeatingJob};
use crate::logging::{event_names, Component};

/// Name of the detection thread.
pub const DETECTION_THREAD_NAME: &str = "rk-anr-detect";

/// Receives detected stalls.
pub trait AnrReporter: Send + Sync {
    fn report_anr(&self, report: &AnrReport) -> rk_common::Result<()>;
}

/// Cancels a task scheduled on a [`MainContext`].
pub trait ScheduledTask: Send + Sync {
    fn cancel(&self);
}

/// The host's primary execution context.
///
/// Hosts that can run a repeating closure on their main loop implement this
/// and the watchdog schedules its own heartbeat. Hosts that cannot call
/// [`Heartbeat::beat`] from the main loop instead.
pub trait MainContext: Send + Sync {
    fn schedule_repeating(
        &self,
        interval: Duration,
        task: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn ScheduledTask>;
}

impl ScheduledTask for RepeatingJob {
    fn cancel(&self) {
        self.stop();
    }
}

/// Marks the main context as responsive.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    flag: Arc<AtomicBool>,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// Watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnrWatchdogConfig {
    pub threshold: Duration,
    pub max_duration: Duration,
    pub heartbeat_interval: Duration,
    pub check_interval: Duration,
    pub check_leeway: Duration,
}

impl Default for AnrWatchdogConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for AnrWatchdogConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            threshold: config.anr_threshold(),
            max_duration: config.max_anr_duration(),
            heartbeat_interval: config.anr_heartbeat_interval(),
            check_interval: config.anr_check_interval(),
            check_leeway: config.anr_check_leeway(),
        }
    }
}

struct Running {
    detection: RepeatingJob,
    heartbeat: Option<Box<dyn ScheduledTask>>,
}

/// Heartbeat/detection pair watching the host's main context.
pub struct AnrWatchdog {
    config: AnrWatchdogConfig,
    responsive: Arc<AtomicBool>,
    reporter: Arc<dyn AnrReporter>,
    main_context: Option<Arc<dyn MainContext>>,
    running: Mutex<Option<Running>>,
}

impl AnrWatchdog {
    pub fn new(config: AnrWatchdogConfig, reporter: Arc<dyn AnrReporter>) -> Self {
        Self {
            config,
            responsive: Arc::new(AtomicBool::new(false)),
            reporter,
            main_context: None,
            running: Mutex::new(None),
        }
    }

    /// Let the watchdog schedule its own heartbeat on `context`.
    pub fn with_main_context(mut self, context: Arc<dyn MainContext>) -> Self {
        self.main_context = Some(context);
        self
    }

    pub fn config(&self) -> &AnrWatchdogConfig {
        &self.config
    }

    /// Handle for beating from the host's main loop.
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            flag: self.responsive.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Start the heartbeat (when a main context is attached) and the
    /// detection thread. Starting a running watchdog is a no-op.
    pub fn start(&self) -> Result<(), JobError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(());
        }

        self.responsive.store(false, Ordering::Relaxed);
        let detection = self.detection_job();
        detection.start()?;

        let heartbeat = self.main_context.as_ref().map(|context| {
            let beat = self.heartbeat();
            context.schedule_repeating(
                self.config.heartbeat_interval,
                Box::new(move || beat.beat()),
            )
        });

        *running = Some(Running {
            detection,
            heartbeat,
        });
        info!(
            component = %Component::Anr,
            event = event_names::ANR_WATCHDOG_STARTED,
            threshold_ms = self.config.threshold.as_millis() as u64,
            max_duration_ms = self.config.max_duration.as_millis() as u64,
            check_interval_ms = self.config.check_interval.as_millis() as u64,
            "ANR watchdog started"
        );
        Ok(())
    }

    /// Stop both tasks. Idempotent.
    pub fn stop(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else { return };
        if let Some(heartbeat) = running.heartbeat {
            heartbeat.cancel();
        }
        running.detection.stop();
        info!(
            component = %Component::Anr,
            event = event_names::ANR_WATCHDOG_STOPPED,
            "ANR watchdog stopped"
        );
    }

    fn detection_job(&self) -> RepeatingJob {
        let flag = self.responsive.clone();
        let reporter = self.reporter.clone();
        let config = self.config;
        let detector = Mutex::new(AnrDetector::new(config.threshold, config.max_duration));
        let last_check = Mutex::new(None::<Instant>);

        RepeatingJob::new(DETECTION_THREAD_NAME, config.check_interval, move || {
            let now = Instant::now();

            {
                let mut last = lock(&last_check);
                if let Some(previous) = *last {
                    let gap = now.saturating_duration_since(previous);
                    if gap > config.check_interval + config.check_leeway {
                        trace!(
                            component = %Component::Anr,
                            gap_ms = gap.as_millis() as u64,
                            "detection check late"
                        );
                    }
                }
                *last = Some(now);
            }

            let responsive = flag.load(Ordering::Relaxed);
            flag.store(false, Ordering::Relaxed);

            let report = lock(&detector).tick(responsive, now);
            if let Some(report) = report {
                deliver(reporter.as_ref(), &report);
            }
        })
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        lock(&self.running)
    }
}

impl Drop for AnrWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver(reporter: &dyn AnrReporter, report: &AnrReport) {
    info!(
        component = %Component::Anr,
        event = event_names::ANR_DETECTED,
        duration_ms = report.duration_ms(),
        capped = report.capped,
        "ANR detected"
    );
    if let Err(e) = reporter.report_anr(report) {
        warn!(
            component = %Component::Anr,
            event = event_names::ANR_REPORT_FAILED,
            duration_ms = report.duration_ms(),
            error = %e,
            "ANR report dropped"
        );
    } else {
        debug!(component = %Component::Anr, "ANR reported");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
