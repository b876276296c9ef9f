//! Timeout recovery.
//!
//! Expired tokens arrive on the timed-out queue with outcome `Timeout`, oldest
//! deadline first. Each policy either puts a token back on the active queue or
//! finishes it with a more severe outcome; completions come out in input order.

use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::RecoveryPolicy;
use crate::engine::{Completion, Engine};
use crate::error::{EngineErrorKind, EngineResult};
use crate::hw::{Hardware, HwCommand};
use crate::metrics;
use crate::registry::QueueKind;
use crate::token::{Origin, Outcome, RetryKind, TokenId};

impl<H: Hardware, C: Clock> Engine<H, C> {
    /// Apply `policy` to tokens collected by [`Engine::collect_expired`].
    ///
    /// Returns the host completions produced by this call. Ids that are not
    /// awaiting recovery are skipped.
    pub fn process_timeouts(
        &mut self,
        policy: RecoveryPolicy,
        expired: Vec<TokenId>,
    ) -> EngineResult<Vec<Completion>> {
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        let start = self.completions.len();
        let mut host = Vec::with_capacity(expired.len());
        for id in expired {
            let awaiting = self.registry.queue_of(id) == Some(QueueKind::TimedOut)
                && self.registry.get(id).is_some_and(|token| !token.held);
            if !awaiting {
                warn!(token = id, queue = ?self.registry.queue_of(id), "token is not awaiting recovery");
                continue;
            }
            if self.token_ref(id)?.origin == Origin::Internal {
                // Release commands are never retried; an unfilled buffer is
                // reclaimed by the matcher watchdog instead.
                self.finish(id, Outcome::Abort)?;
                continue;
            }
            host.push(id);
        }
        match policy {
            RecoveryPolicy::Abort => {
                for id in host {
                    self.finish(id, Outcome::Abort)?;
                }
            }
            RecoveryPolicy::ResetRetry => {
                for id in host {
                    self.reset_and_retry(id)?;
                }
            }
            RecoveryPolicy::MigrateRetry => self.migrate_and_retry(host)?,
            RecoveryPolicy::Die => self.die(host)?,
        }
        Ok(self.completions[start..].to_vec())
    }

    fn reset_and_retry(&mut self, id: TokenId) -> EngineResult<()> {
        let resets = self.token_ref(id)?.counters.resets;
        if resets >= self.config.recovery.max_resets {
            warn!(token = id, resets, "reset budget exhausted");
            return self.finish(id, Outcome::Abort);
        }
        if !self.guard.can_start_new_work() {
            debug!(token = id, state = ?self.guard.state(), "run state forbids reset");
            return self.finish(id, Outcome::Abort);
        }
        let command = {
            let token = self.token_mut(id)?;
            token.parity = !token.parity;
            token.words = token.words.toggled_parity();
            HwCommand {
                token: id,
                words: token.words,
                checksum: token.checksum,
                core: token.core,
                write: token.write,
                read: token.read,
            }
        };
        if let Err(err) = self.hw.reset(&command) {
            warn!(token = id, error = %err, "reset failed");
            return self.finish(id, Outcome::Abort);
        }
        let deadline = self.clock.now() + self.config.timeouts.for_state(self.guard.state());
        {
            let token = self.token_mut(id)?;
            token.counters.resets += 1;
            token.outcome = Outcome::Active;
            token.deadline = Some(deadline);
            token.retry = Some(RetryKind::AfterReset);
            debug!(token = id, resets = token.counters.resets, "token reset");
        }
        self.registry.move_to(id, QueueKind::Active);
        self.stats.resets += 1;
        metrics::observe_reset();
        Ok(())
    }

    fn migrate_and_retry(&mut self, ids: Vec<TokenId>) -> EngineResult<()> {
        if !self.guard.can_start_new_work() {
            for id in ids {
                self.finish(id, Outcome::Abort)?;
            }
            return Ok(());
        }
        for id in ids {
            let token = self.token_ref(id)?;
            if token.is_write() && token.write.is_none() {
                warn!(token = id, "write data no longer staged, cannot migrate");
                self.finish(id, Outcome::Abort)?;
                continue;
            }
            let new = match self.migrate(id) {
                Ok(new) => new,
                Err(err) => {
                    warn!(token = id, error = %err, "migration failed");
                    self.finish(id, Outcome::Abort)?;
                    continue;
                }
            };
            // The original keeps its timeout outcome and gives up its slot.
            self.release_inner(id)?;
            match self.dispatch(new, true) {
                Ok(_) => self.token_mut(new)?.counters.reissues += 1,
                Err(err) if err.kind() == EngineErrorKind::WindowFull => {
                    debug!(token = new, "migrated command waits for the sequence window");
                }
                Err(err) => {
                    warn!(token = new, error = %err, "migrated command issue failed");
                    self.finish(new, Outcome::Abort)?;
                }
            }
        }
        Ok(())
    }

    fn die(&mut self, ids: Vec<TokenId>) -> EngineResult<()> {
        error!(expired = ids.len(), "command timeout, terminating engine");
        for id in ids {
            self.finish(id, Outcome::Abort)?;
        }
        self.guard.set_state(crate::guard::RunState::Terminating);
        let mut in_flight = self.registry.ids(QueueKind::Active);
        in_flight.extend(
            self.registry
                .iter(QueueKind::TimedOut)
                .filter(|id| self.registry.get(*id).is_some_and(|token| !token.held)),
        );
        for id in in_flight {
            if self.token_ref(id)?.request.is_some() {
                self.finish(id, Outcome::Abort)?;
            }
        }
        self.dump_state("die policy");
        Ok(())
    }
}
