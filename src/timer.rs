use std::time::{Duration, Instant};

/// Periodic deadline owned by a controller and polled by the dispatcher.
///
/// Stopping clears the deadline, so no tick is reported after `stop()`.
#[derive(Debug, Clone)]
pub(crate) struct Timer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Takes effect from the next tick; a running timer is rescheduled.
    pub(crate) fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        if self.deadline.is_some() {
            self.deadline = Some(now + interval);
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Starts counting from `now`. Starting a running timer keeps its phase.
    pub(crate) fn start(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    pub(crate) fn stop(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}
