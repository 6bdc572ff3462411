//! ANR detection state machine.
//!
//! The detector is fed one observation per check: whether the main context
//! beat since the previous check. It is driven by the watchdog thread in
//! production and directly by tests with synthetic instants.

use std::time::{Duration, Instant};

use serde::Serialize;

/// A main-context stall long enough to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnrReport {
    /// How long the main context had been unresponsive when reported.
    pub duration: Duration,
    /// True when reported because the stall reached the max duration
    /// rather than because the main context recovered.
    pub capped: bool,
}

impl AnrReport {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Open-stall tracking for one watchdog.
#[derive(Debug, Clone)]
pub struct AnrDetector {
    threshold: Duration,
    max_duration: Duration,
    anr_started_at: Option<Instant>,
}

impl AnrDetector {
    pub fn new(threshold: Duration, max_duration: Duration) -> Self {
        Self {
            threshold,
            max_duration,
            anr_started_at: None,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// When the current unreported stall was first observed.
    pub fn stall_started_at(&self) -> Option<Instant> {
        self.anr_started_at
    }

    /// Process one check.
    pub fn tick(&mut self, responsive: bool, now: Instant) -> Option<AnrReport> {
        if responsive {
            let started = self.anr_started_at.take()?;
            let duration = now.saturating_duration_since(started);
            return (duration >= self.threshold).then_some(AnrReport {
                duration,
                capped: false,
            });
        }

        match self.anr_started_at {
            None => {
                self.anr_started_at = Some(now);
                None
            }
            Some(started) => {
                let duration = now.saturating_duration_since(started);
                if duration >= self.max_duration {
                    self.anr_started_at = None;
                    Some(AnrReport {
                        duration,
                        capped: true,
                    })
                } else {
                    None
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.anr_started_at = None;
    }
}
