use core::time::Duration;
use metrics::{counter, gauge, histogram};

use crate::engine::EngineCounters;
use crate::token::Outcome;

pub fn observe_issue(reissue: bool) {
    counter!("csd_engine_issued_count").increment(1);
    if reissue {
        counter!("csd_engine_reissued_count").increment(1);
    }
}

pub fn observe_completion(outcome: Outcome, latency: Option<Duration>) {
    counter!("csd_engine_completed_count", "outcome" => outcome.as_str()).increment(1);
    if let Some(latency) = latency {
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        histogram!("csd_engine_completion_latency_ns").record(ns as f64);
    }
}

pub fn observe_timeout() {
    counter!("csd_engine_timeout_count").increment(1);
}

pub fn observe_reset() {
    counter!("csd_engine_reset_count").increment(1);
}

pub fn observe_migration() {
    counter!("csd_engine_migration_count").increment(1);
}

pub fn observe_match(attempt: u32) {
    counter!("csd_engine_match_count", "attempt" => if attempt == 0 { "first" } else { "retry" })
        .increment(1);
}

pub fn observe_match_error() {
    counter!("csd_engine_match_error_count").increment(1);
}

pub fn observe_watchdog_expiry() {
    counter!("csd_engine_watchdog_expiry_count").increment(1);
}

pub fn record_holdoff(delay: Duration) {
    gauge!("csd_engine_holdoff_delay_us").set(delay.as_micros() as f64);
}

pub fn record_depths(counters: &EngineCounters) {
    gauge!("csd_engine_tokens_free").set(counters.free as f64);
    gauge!("csd_engine_tokens_active").set(counters.active as f64);
    gauge!("csd_engine_tokens_timed_out").set(counters.timed_out as f64);
    gauge!("csd_engine_tokens_resumable").set(counters.resumable as f64);
    gauge!("csd_engine_early_completed").set(counters.early_completed as f64);
    gauge!("csd_engine_read_awaiting_fill").set(counters.read_awaiting_fill as f64);
    gauge!("csd_engine_read_awaiting_dealloc").set(counters.read_awaiting_dealloc as f64);
}
