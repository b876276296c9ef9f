//! Read buffer matching for MCE-free hardware.
//!
//! Completions do not say which read buffer received the data. Buffers fill in
//! the order they were posted, so the head of the awaiting-fill queue is the
//! only candidate; its marker names the command that filled it.

use std::time::{Duration, Instant};

use csd_pool::{BufferSpan, ResourceId};
use csd_proto::{decode_marker, CommandWords, InvalidMarker, MarkerMatch};
use tracing::{debug, error, trace, warn};

use crate::clock::Clock;
use crate::engine::Engine;
use crate::error::{EngineError, EngineErrorKind, EngineResult};
use crate::hw::Hardware;
use crate::metrics;
use crate::registry::QueueKind;
use crate::token::{Outcome, TokenId};

impl<H: Hardware, C: Clock> Engine<H, C> {
    /// Bind filled read buffers to their commands while early-completed reads
    /// are outstanding. Returns the number of buffers bound.
    pub fn drain_matches(&mut self) -> EngineResult<usize> {
        if !self.config.mce_free {
            return Ok(0);
        }
        let mut matched = 0;
        loop {
            if self.early.is_empty() {
                let now = self.clock.now();
                self.watchdog.record_progress(now);
                break;
            }
            let Some(buffer) = self.read.fill_head() else {
                break;
            };
            self.wait_holdoff(buffer);
            match self.match_buffer(buffer)? {
                Some((id, attempt)) => {
                    self.bind_match(buffer, id)?;
                    let now = self.clock.now();
                    if attempt == 0 {
                        self.holdoff.on_first_attempt_success(now);
                        self.stats.first_attempt_matches += 1;
                    } else {
                        self.holdoff.on_error(now);
                    }
                    self.watchdog.record_progress(now);
                    self.stats.matches += 1;
                    metrics::observe_match(attempt);
                    metrics::record_holdoff(self.holdoff.delay());
                    matched += 1;
                }
                None => {
                    let now = self.clock.now();
                    self.holdoff.on_error(now);
                    self.stats.match_errors += 1;
                    metrics::observe_match_error();
                    metrics::record_holdoff(self.holdoff.delay());
                    if self.watchdog.record_stall(now) {
                        self.expire_watchdog(now);
                    }
                    break;
                }
            }
        }
        Ok(matched)
    }

    fn wait_holdoff(&mut self, buffer: ResourceId) {
        let Some(released) = self.read.last_release(buffer) else {
            return;
        };
        let ready = self.holdoff.ready_at(released);
        let limit = self.clock.now() + self.holdoff.ceiling();
        self.clock.wait_until(ready.min(limit));
    }

    /// Read the marker of `buffer` up to the attempt budget. Only the final
    /// attempt may fall back to the legacy encoding.
    fn match_buffer(&mut self, buffer: ResourceId) -> EngineResult<Option<(TokenId, u32)>> {
        let attempts = self.config.matcher.attempts;
        let delay = Duration::from_micros(self.config.matcher.retry_delay_us);
        let mut reason: Option<InvalidMarker> = None;
        for attempt in 0..attempts {
            let final_attempt = attempt + 1 == attempts;
            let allow_legacy = final_attempt && self.config.matcher.legacy_fallback;
            let marker = self.hw.read_marker(buffer);
            let found = match decode_marker(&marker, allow_legacy) {
                MarkerMatch::Command(words) => self.confirm_command(words)?,
                MarkerMatch::CoreBuffer(core) => self.confirm_legacy(core as ResourceId)?,
                MarkerMatch::Invalid(invalid) => {
                    reason = Some(invalid);
                    None
                }
            };
            if let Some(id) = found {
                trace!(buffer, token = id, attempt, "read buffer matched");
                return Ok(Some((id, attempt)));
            }
            if !final_attempt {
                self.clock.pause(delay);
            }
        }
        debug!(buffer, attempts, reason = ?reason, "no command matched read buffer");
        self.dump_state("unmatched read buffer");
        Ok(None)
    }

    /// A full-command marker names its token; the token's remembered words must
    /// agree exactly.
    fn confirm_command(&self, words: CommandWords) -> EngineResult<Option<TokenId>> {
        let id = words.token_id();
        let Some(token) = self.registry.get(id) else {
            return Ok(None);
        };
        let live = self.registry.queue_of(id) == Some(QueueKind::Active)
            && token.sequence.is_some()
            && token.words == words;
        if !live || token.read.is_some() {
            trace!(token = id, "marker names no waiting command");
            return Ok(None);
        }
        if !token.is_read() {
            return Err(EngineError::with_message(
                EngineErrorKind::MatchMismatch,
                format!("token {id} matched a read buffer but is not a read"),
            ));
        }
        Ok(Some(id))
    }

    /// A legacy marker names a core buffer; its owner comes from the side table.
    fn confirm_legacy(&mut self, core: ResourceId) -> EngineResult<Option<TokenId>> {
        let Some(id) = self.core_owner(core) else {
            trace!(core, "legacy marker names an unowned core buffer");
            return Ok(None);
        };
        let Some(token) = self.registry.get(id) else {
            return Ok(None);
        };
        let live = self.registry.queue_of(id) == Some(QueueKind::Active)
            && token.sequence.is_some()
            && token.read.is_none();
        if !live {
            return Ok(None);
        }
        if !token.is_read() {
            return Err(EngineError::with_message(
                EngineErrorKind::MatchMismatch,
                format!("core buffer {core} owner {id} is not a read"),
            ));
        }
        if self.last_legacy_core == Some(core) {
            self.stats.stale_legacy_accepts += 1;
            warn!(core, token = id, "accepting repeated legacy core buffer id");
        }
        self.last_legacy_core = Some(core);
        Ok(Some(id))
    }

    fn bind_match(&mut self, buffer: ResourceId, id: TokenId) -> EngineResult<()> {
        // A refill proves hardware processed the earlier release of this buffer.
        if let Some(release) = self.read.release_owner(buffer) {
            let outstanding = self.registry.queue_of(release) == Some(QueueKind::Active)
                && self
                    .registry
                    .get(release)
                    .is_some_and(|token| token.pending_release == Some(buffer));
            if outstanding {
                debug!(buffer, token = release, "read buffer release inferred from refill");
                self.stats.inferred_releases += 1;
                self.finish(release, Outcome::Ok)?;
            }
        }
        let claimed = self.read.claim_head(id)?;
        if claimed != buffer {
            return Err(EngineError::with_message(
                EngineErrorKind::InvalidState,
                format!("fill head moved from {buffer} to {claimed}"),
            ));
        }
        let early_status = {
            let token = self.token_mut(id)?;
            token.read = Some(BufferSpan::single(buffer));
            token.early_status
        };
        match early_status {
            Some(status) => self.finish(id, status),
            None => {
                trace!(token = id, buffer, "read data arrived ahead of its completion");
                Ok(())
            }
        }
    }

    fn expire_watchdog(&mut self, now: Instant) {
        error!(
            iterations = self.watchdog.iterations(),
            buffer = ?self.read.fill_head(),
            "read buffer matching stalled, reclaiming fill head"
        );
        self.stats.watchdog_expiries += 1;
        metrics::observe_watchdog_expiry();
        self.read.force_claim_head();
        self.watchdog.record_progress(now);
        self.dump_state("matcher watchdog expired");
    }
}

#[cfg(test)]
mod tests {
    use csd_proto::{encode_command_marker, encode_legacy_marker, Opcode};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::hw::HwStatus;
    use crate::sim::SimAccelerator;
    use crate::token::{CommandShape, IoRequest};

    fn engine() -> Engine<SimAccelerator, ManualClock> {
        let mut config = EngineConfig {
            tokens: 8,
            ..EngineConfig::default()
        };
        config.pools.read_buffers = 4;
        config.matcher.attempts = 3;
        config.matcher.watchdog_iterations = 3;
        let mut engine = Engine::new(config, SimAccelerator::new(), ManualClock::new()).unwrap();
        engine.start();
        engine
    }

    fn completed_read(engine: &mut Engine<SimAccelerator, ManualClock>, tag: u64) -> TokenId {
        let id = engine.allocate(CommandShape::read(4096)).unwrap();
        engine.issue(id, IoRequest::read(tag, tag)).unwrap();
        engine.hardware_mut().complete(id, HwStatus::Ok);
        engine.poll_status().unwrap();
        id
    }

    #[test]
    fn command_marker_binds_head_buffer() {
        let mut engine = engine();
        let id = completed_read(&mut engine, 1);
        assert_eq!(engine.early_completed().collect::<Vec<_>>(), vec![id]);
        engine.hardware_mut().fill_command(0, id);

        assert_eq!(engine.drain_matches().unwrap(), 1);
        let done = engine.take_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, Outcome::Ok);
        assert_eq!(done[0].read, Some(BufferSpan::single(0)));
        assert_eq!(engine.read_pool().owner(0), Some(id));
        assert_eq!(engine.early_completed().count(), 0);
        assert_eq!(engine.counters().first_attempt_matches, 1);
    }

    #[test]
    fn data_before_status_only_binds() {
        let mut engine = engine();
        let waiting = completed_read(&mut engine, 1);
        let ahead = engine.allocate(CommandShape::read(512)).unwrap();
        engine.issue(ahead, IoRequest::read(2, 2)).unwrap();
        engine.hardware_mut().fill_command(0, ahead);
        engine.hardware_mut().fill_command(1, waiting);

        assert_eq!(engine.drain_matches().unwrap(), 2);
        let done = engine.take_completions();
        assert_eq!(done.iter().map(|c| c.token).collect::<Vec<_>>(), vec![waiting]);
        assert_eq!(engine.queue_of(ahead), Some(QueueKind::Active));
        assert_eq!(
            engine.token(ahead).unwrap().read_buffer(),
            Some(BufferSpan::single(0))
        );

        engine.hardware_mut().complete(ahead, HwStatus::Ok);
        engine.poll_status().unwrap();
        let done = engine.take_completions();
        assert_eq!(done[0].token, ahead);
        assert_eq!(done[0].read, Some(BufferSpan::single(0)));
    }

    #[test]
    fn words_must_match_exactly() {
        let mut engine = engine();
        let id = completed_read(&mut engine, 1);
        let mut words = engine.token(id).unwrap().words();
        words.0[1] ^= 1;
        engine
            .hardware_mut()
            .set_marker(0, encode_command_marker(words));

        assert_eq!(engine.drain_matches().unwrap(), 0);
        assert_eq!(engine.read_pool().owner(0), None);
        assert_eq!(engine.counters().match_errors, 1);
        assert!(engine.take_completions().is_empty());
    }

    #[test]
    fn retry_success_climbs_holdoff() {
        let mut engine = engine();
        let id = completed_read(&mut engine, 1);
        let words = engine.token(id).unwrap().words();
        let before = engine.counters().holdoff_delay_us;
        engine
            .hardware_mut()
            .script_markers(0, vec![[0u8; 64], encode_command_marker(words)]);

        assert_eq!(engine.drain_matches().unwrap(), 1);
        assert!(engine.counters().holdoff_delay_us > before);
        assert_eq!(engine.counters().first_attempt_matches, 0);
    }

    #[test]
    fn legacy_marker_only_on_final_attempt() {
        let mut engine = engine();
        let id = completed_read(&mut engine, 1);
        let core = engine.token(id).unwrap().core().unwrap().first;
        engine
            .hardware_mut()
            .set_marker(0, encode_legacy_marker(core as u8));

        assert_eq!(engine.drain_matches().unwrap(), 1);
        assert_eq!(engine.hardware().marker_reads(), 3);
        assert_eq!(engine.read_pool().owner(0), Some(id));
    }

    #[test]
    fn repeated_legacy_id_is_counted() {
        let mut engine = engine();
        for buffer in 0..2 {
            let id = completed_read(&mut engine, buffer as u64);
            let core = engine.token(id).unwrap().core().unwrap().first;
            engine
                .hardware_mut()
                .set_marker(buffer, encode_legacy_marker(core as u8));
            assert_eq!(engine.drain_matches().unwrap(), 1);
            // Free the core buffer so the next read reuses the same id.
            engine.release(id).unwrap();
        }
        assert_eq!(engine.counters().stale_legacy_accepts, 1);
    }

    #[test]
    fn write_token_in_read_buffer_is_an_error() {
        let mut engine = engine();
        completed_read(&mut engine, 1);
        let write = engine.allocate(CommandShape::write(512)).unwrap();
        engine.issue(write, IoRequest::write(0, 2)).unwrap();
        let words = engine.token(write).unwrap().words();
        assert_eq!(words.opcode_byte(), u8::from(Opcode::Write));
        engine
            .hardware_mut()
            .set_marker(0, encode_command_marker(words));

        let err = engine.drain_matches().unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::MatchMismatch);
    }

    #[test]
    fn watchdog_reclaims_stuck_head() {
        let mut engine = engine();
        completed_read(&mut engine, 1);
        for _ in 0..2 {
            assert_eq!(engine.drain_matches().unwrap(), 0);
            assert_eq!(engine.read_pool().fill_head(), Some(0));
        }
        assert_eq!(engine.drain_matches().unwrap(), 0);
        assert_eq!(engine.counters().watchdog_expiries, 1);
        assert_eq!(engine.read_pool().fill_head(), Some(1));
        assert_eq!(engine.read_pool().awaiting_dealloc_len(), 1);
        assert_eq!(engine.read_pool().owner(0), None);

        assert_eq!(engine.send_read_releases().unwrap(), 1);
        let release = engine.hardware().issued().last().copied().unwrap();
        assert_eq!(release.words.opcode_byte(), u8::from(Opcode::ReleaseReadBuffer));
        assert_eq!(release.words.0[1], 0);
    }

    #[test]
    fn late_release_after_reclaim_keeps_new_release() {
        let mut config = EngineConfig {
            tokens: 8,
            ..EngineConfig::default()
        };
        config.pools.read_buffers = 1;
        config.matcher.attempts = 3;
        config.matcher.watchdog_iterations = 3;
        let mut engine = Engine::new(config, SimAccelerator::new(), ManualClock::new()).unwrap();
        engine.start();

        let first = completed_read(&mut engine, 1);
        engine.hardware_mut().fill_command(0, first);
        engine.drain_matches().unwrap();
        engine.take_completions();
        engine.release(first).unwrap();
        assert_eq!(engine.send_read_releases().unwrap(), 1);
        let stale = engine.read_pool().release_owner(0).unwrap();

        completed_read(&mut engine, 2);
        engine.hardware_mut().set_marker(0, [0; 64]);
        for _ in 0..3 {
            engine.drain_matches().unwrap();
        }
        assert_eq!(engine.counters().watchdog_expiries, 1);
        assert_eq!(engine.read_pool().release_owner(0), None);

        assert_eq!(engine.send_read_releases().unwrap(), 1);
        let current = engine.read_pool().release_owner(0).unwrap();
        assert_ne!(current, stale);

        engine.hardware_mut().complete(stale, HwStatus::Ok);
        engine.poll_status().unwrap();
        assert_eq!(engine.queue_of(stale), Some(QueueKind::Free));
        assert_eq!(engine.read_pool().release_owner(0), Some(current));

        engine.hardware_mut().complete(current, HwStatus::Ok);
        engine.poll_status().unwrap();
        assert_eq!(engine.read_pool().release_owner(0), None);
        assert_eq!(engine.queue_of(current), Some(QueueKind::Free));
    }

    #[test]
    fn refill_infers_outstanding_release() {
        let mut engine = engine();
        let first = completed_read(&mut engine, 1);
        engine.hardware_mut().fill_command(0, first);
        engine.drain_matches().unwrap();
        engine.take_completions();
        engine.release(first).unwrap();
        assert_eq!(engine.send_read_releases().unwrap(), 1);
        let release = engine.read_pool().release_owner(0).unwrap();
        assert_eq!(engine.queue_of(release), Some(QueueKind::Active));

        // Buffers 1..=3 are consumed so buffer 0 is at the head again.
        for buffer in 1..4 {
            let id = completed_read(&mut engine, 10 + buffer as u64);
            engine.hardware_mut().fill_command(buffer, id);
            assert_eq!(engine.drain_matches().unwrap(), 1);
        }
        let again = completed_read(&mut engine, 20);
        engine.hardware_mut().fill_command(0, again);
        assert_eq!(engine.drain_matches().unwrap(), 1);

        assert_eq!(engine.counters().inferred_releases, 1);
        assert_eq!(engine.read_pool().release_owner(0), None);
        assert_eq!(engine.queue_of(release), Some(QueueKind::Free));
        assert_eq!(engine.read_pool().owner(0), Some(again));
    }
}
