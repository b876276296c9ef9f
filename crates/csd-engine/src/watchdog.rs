use std::time::{Duration, Instant};

/// Bounds how long the matcher may go without binding a buffer.
#[derive(Clone, Debug)]
pub struct ProgressWatchdog {
    max_iterations: u64,
    timeout: Duration,
    iterations: u64,
    last_progress: Instant,
}

impl ProgressWatchdog {
    pub fn new(max_iterations: u64, timeout: Duration, now: Instant) -> Self {
        Self {
            max_iterations,
            timeout,
            iterations: 0,
            last_progress: now,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// A buffer was matched, or nothing is waiting for one.
    pub fn record_progress(&mut self, now: Instant) {
        self.iterations = 0;
        self.last_progress = now;
    }

    /// Count a fruitless pass. Returns true once either limit is reached.
    pub fn record_stall(&mut self, now: Instant) -> bool {
        self.iterations += 1;
        self.iterations >= self.max_iterations
            || now.saturating_duration_since(self.last_progress) >= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_on_iteration_cap() {
        let now = Instant::now();
        let mut dog = ProgressWatchdog::new(3, Duration::from_secs(60), now);
        assert!(!dog.record_stall(now));
        assert!(!dog.record_stall(now));
        assert!(dog.record_stall(now));
        dog.record_progress(now);
        assert_eq!(dog.iterations(), 0);
        assert!(!dog.record_stall(now));
    }

    #[test]
    fn expires_on_elapsed_time() {
        let now = Instant::now();
        let mut dog = ProgressWatchdog::new(1_000, Duration::from_millis(5), now);
        assert!(!dog.record_stall(now + Duration::from_millis(4)));
        assert!(dog.record_stall(now + Duration::from_millis(5)));
    }
}
