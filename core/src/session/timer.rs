use std::time::{Duration, Instant};

/// Liveness timer. A stopped timer reads as never started.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    started: Option<Instant>,
}

impl Timer {
    /// A timer that is not running.
    pub fn new() -> Self {
        Self::default()
    }

    /// A timer started now.
    pub fn started() -> Self {
        Self {
            started: Some(Instant::now()),
        }
    }

    pub fn restart(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Time since the last (re)start, `None` when stopped.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|started| started.elapsed())
    }

    /// True when running for longer than `timeout`.
    pub fn expired(&self, timeout: Duration) -> bool {
        self.elapsed().map(|elapsed| elapsed > timeout).unwrap_or(false)
    }
}
