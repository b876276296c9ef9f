use std::time::{Duration, Instant};

/// Minimum spacing between diagnostic dumps.
#[derive(Clone, Debug)]
pub struct DiagLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl DiagLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of dumps skipped since the last allowed one, or `None`
    /// if this one must be skipped too.
    pub fn allow(&mut self, now: Instant) -> Option<u64> {
        let due = self
            .last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_reports_suppressed() {
        let mut limiter = DiagLimiter::new(Duration::from_millis(10));
        let now = Instant::now();
        assert_eq!(limiter.allow(now), Some(0));
        assert_eq!(limiter.allow(now + Duration::from_millis(1)), None);
        assert_eq!(limiter.allow(now + Duration::from_millis(2)), None);
        assert_eq!(limiter.allow(now + Duration::from_millis(10)), Some(2));
    }
}
