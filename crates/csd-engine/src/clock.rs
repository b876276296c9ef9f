use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source for deadlines and the bounded waits of the matcher.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Busy-wait until `deadline`. Callers bound the deadline themselves.
    fn wait_until(&self, deadline: Instant);

    fn pause(&self, duration: Duration) {
        self.wait_until(self.now() + duration);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wait_until(&self, deadline: Instant) {
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Clock that only moves when told to. Waiting jumps straight to the deadline.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poison| poison.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn wait_until(&self, deadline: Instant) {
        let mut now = self.now.lock().unwrap_or_else(|poison| poison.into_inner());
        if *now < deadline {
            *now = deadline;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_on_request() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_millis(3));
        assert_eq!(clock.now() - start, Duration::from_millis(3));
        clock.pause(Duration::from_micros(7));
        assert_eq!(
            clock.now() - start,
            Duration::from_millis(3) + Duration::from_micros(7)
        );
    }

    #[test]
    fn manual_clock_never_goes_backwards() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(1));
        clock.wait_until(start);
        assert_eq!(clock.now() - start, Duration::from_secs(1));
    }

    #[test]
    fn clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::from_millis(1));
        assert_eq!(clock.now() - start, Duration::from_millis(1));
    }
}
