use std::time::{Duration, Instant};

use crate::config::HoldOffConfig;

/// Adaptive wait between a read buffer's release and trusting its marker.
///
/// Clean first-attempt matches walk the delay down toward the floor, but only
/// once the cool-down since the last error has passed. Retried matches and
/// failures walk it up toward the ceiling.
#[derive(Clone, Debug)]
pub struct HoldOff {
    delay: Duration,
    floor: Duration,
    ceiling: Duration,
    climb: Duration,
    drop: Duration,
    cooldown: Duration,
    last_error: Option<Instant>,
}

impl HoldOff {
    pub fn new(config: &HoldOffConfig) -> Self {
        Self {
            delay: Duration::from_micros(config.initial_us),
            floor: Duration::from_micros(config.floor_us),
            ceiling: Duration::from_micros(config.ceiling_us),
            climb: Duration::from_micros(config.climb_us),
            drop: Duration::from_micros(config.drop_us),
            cooldown: Duration::from_micros(config.cooldown_us),
            last_error: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Instant before which a buffer released at `released` must not be inspected.
    pub fn ready_at(&self, released: Instant) -> Instant {
        released + self.delay
    }

    pub fn on_first_attempt_success(&mut self, now: Instant) {
        let cooled = self
            .last_error
            .map_or(true, |at| now.saturating_duration_since(at) >= self.cooldown);
        if cooled {
            self.delay = self.delay.saturating_sub(self.drop).max(self.floor);
        }
    }

    /// A match needed retries, or no match was found.
    pub fn on_error(&mut self, now: Instant) {
        self.last_error = Some(now);
        self.delay = (self.delay + self.climb).min(self.ceiling);
    }
}
