use std::collections::VecDeque;
use std::time::{Duration, Instant};

use csd_pool::{BufferSpan, ReadBufferPool, ResourceId, ResourcePool};
use csd_proto::{command_checksum, units_for_len, Command, CommandFlags, Opcode};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::diag::DiagLimiter;
use crate::error::{EngineError, EngineErrorKind, EngineResult};
use crate::guard::{RunGuard, RunState};
use crate::holdoff::HoldOff;
use crate::hw::{HwCommand, HwCompletion, Hardware};
use crate::metrics;
use crate::registry::{QueueKind, TokenRegistry};
use crate::token::{CommandShape, IoRequest, Origin, Outcome, RetryKind, Token, TokenClass, TokenId};
use crate::watchdog::ProgressWatchdog;

/// Terminal result of a host command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub token: TokenId,
    pub outcome: Outcome,
    /// Cookie from the [`IoRequest`].
    pub tag: u64,
    /// Read buffers holding the data, for successful reads.
    pub read: Option<BufferSpan>,
    pub sequence: Option<u64>,
}

/// What one [`Engine::poll`] pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub status: usize,
    pub matched: usize,
    pub expired: usize,
    pub recovered: usize,
    pub releases: usize,
    pub reissued: usize,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        *self == PollReport::default()
    }
}

/// Snapshot of queue depths, pool availability and lifetime event counts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub run_state: RunState,
    pub free: usize,
    pub active: usize,
    pub timed_out: usize,
    pub held: usize,
    pub resumable: usize,
    pub early_completed: usize,
    pub outstanding_sequences: usize,
    pub core_available: usize,
    pub write_available: usize,
    pub read_available: usize,
    pub read_awaiting_fill: usize,
    pub read_awaiting_dealloc: usize,
    pub holdoff_delay_us: u64,
    pub issued: u64,
    pub reissued: u64,
    pub completed_ok: u64,
    pub completed_failed: u64,
    pub timeouts: u64,
    pub resets: u64,
    pub retries: u64,
    pub migrations: u64,
    pub release_commands: u64,
    pub inferred_releases: u64,
    pub matches: u64,
    pub first_attempt_matches: u64,
    pub match_errors: u64,
    pub watchdog_expiries: u64,
    pub stale_legacy_accepts: u64,
    pub stale_completions: u64,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Stats {
    pub(crate) issued: u64,
    pub(crate) reissued: u64,
    pub(crate) completed_ok: u64,
    pub(crate) completed_failed: u64,
    pub(crate) timeouts: u64,
    pub(crate) resets: u64,
    pub(crate) retries: u64,
    pub(crate) migrations: u64,
    pub(crate) release_commands: u64,
    pub(crate) inferred_releases: u64,
    pub(crate) matches: u64,
    pub(crate) first_attempt_matches: u64,
    pub(crate) match_errors: u64,
    pub(crate) watchdog_expiries: u64,
    pub(crate) stale_legacy_accepts: u64,
    pub(crate) stale_completions: u64,
}

type CompletionHook = Box<dyn FnMut(&Completion) + Send>;

/// Resources taken during allocation, unwound newest first on failure.
enum Acquired {
    Token(TokenId),
    Core(usize, BufferSpan),
    Write(ResourceId),
}

/// Command engine for one accelerator.
///
/// Every mutating call takes `&mut self`; the owner serializes access. Tokens
/// and buffers are created here once and only change ownership afterwards.
pub struct Engine<H, C = SystemClock> {
    pub(crate) config: EngineConfig,
    pub(crate) hw: H,
    pub(crate) clock: C,
    pub(crate) registry: TokenRegistry,
    pub(crate) core: Vec<ResourcePool>,
    pub(crate) write: ResourcePool,
    pub(crate) read: ReadBufferPool,
    pub(crate) guard: RunGuard,
    /// Reads whose status arrived before their data was tied to a buffer.
    pub(crate) early: VecDeque<TokenId>,
    pub(crate) completions: Vec<Completion>,
    hook: Option<CompletionHook>,
    pub(crate) holdoff: HoldOff,
    pub(crate) watchdog: ProgressWatchdog,
    pub(crate) diag: DiagLimiter,
    pub(crate) stats: Stats,
    pub(crate) last_legacy_core: Option<ResourceId>,
}

impl<H: Hardware, C: Clock> Engine<H, C> {
    pub fn new(config: EngineConfig, hw: H, clock: C) -> EngineResult<Self> {
        config.validate()?;
        let pools = &config.pools;
        let strategy = pools.strategy;
        let core = if config.partitioned() {
            let hardware = pools.core_buffers - pools.firmware_core_buffers;
            vec![
                ResourcePool::new("core-hw", 0, hardware, strategy)?,
                ResourcePool::new("core-fw", hardware, pools.firmware_core_buffers, strategy)?,
            ]
        } else {
            vec![ResourcePool::new("core", 0, pools.core_buffers, strategy)?]
        };
        let write = ResourcePool::new("write", 0, pools.write_buffers, strategy)?;
        let mut read = ReadBufferPool::new(pools.read_buffers, strategy)?;
        if config.mce_free {
            read.arm_all();
        }
        let now = clock.now();
        let watchdog = ProgressWatchdog::new(
            config.matcher.watchdog_iterations,
            Duration::from_millis(config.matcher.watchdog_timeout_ms),
            now,
        );
        info!(
            tokens = config.tokens,
            core_buffers = pools.core_buffers,
            read_buffers = pools.read_buffers,
            mce_free = config.mce_free,
            policy = ?config.effective_policy(),
            "command engine created"
        );
        Ok(Self {
            registry: TokenRegistry::new(config.tokens),
            guard: RunGuard::new(config.sequence_window),
            holdoff: HoldOff::new(&config.holdoff),
            diag: DiagLimiter::new(Duration::from_millis(config.diag_interval_ms)),
            watchdog,
            core,
            write,
            read,
            early: VecDeque::new(),
            completions: Vec::new(),
            hook: None,
            stats: Stats::default(),
            last_legacy_core: None,
            config,
            hw,
            clock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn token(&self, id: TokenId) -> Option<&Token> {
        self.registry.get(id)
    }

    pub fn queue_of(&self, id: TokenId) -> Option<QueueKind> {
        self.registry.queue_of(id)
    }

    pub fn read_pool(&self) -> &ReadBufferPool {
        &self.read
    }

    pub fn write_pool(&self) -> &ResourcePool {
        &self.write
    }

    /// Core buffer pools; two when partitioned by class (hardware first).
    pub fn core_pools(&self) -> &[ResourcePool] {
        &self.core
    }

    /// Token owning core buffer `id`, from the reverse side table.
    pub fn core_owner(&self, id: ResourceId) -> Option<TokenId> {
        self.core.iter().find_map(|pool| pool.owner(id))
    }

    pub fn early_completed(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.early.iter().copied()
    }

    pub fn run_state(&self) -> RunState {
        self.guard.state()
    }

    pub fn set_run_state(&mut self, next: RunState) -> bool {
        self.guard.set_state(next)
    }

    /// Leave initialization and accept host work.
    pub fn start(&mut self) -> bool {
        self.guard.set_state(RunState::Running)
    }

    pub fn oldest_active_sequence(&self) -> u64 {
        self.guard.oldest_active_sequence()
    }

    /// Earliest deadline among active tokens; the caller may sleep until then.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry
            .iter(QueueKind::Active)
            .filter_map(|id| self.registry.get(id).and_then(|token| token.deadline))
            .min()
    }

    /// Invoke `hook` once per host token when it reaches a terminal outcome.
    pub fn set_completion_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&Completion) + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
    }

    /// Drain completions accumulated since the previous call.
    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    /// Take a free token and the buffers `shape` needs.
    ///
    /// Returns `None` when the run state forbids new work, the shape cannot be
    /// served, or any resource is exhausted. Partial acquisitions are undone.
    pub fn allocate(&mut self, shape: CommandShape) -> Option<TokenId> {
        if !self.guard.can_start_new_work() {
            debug!(state = ?self.guard.state(), "allocation refused by run state");
            return None;
        }
        if self.registry.depth(QueueKind::Free) <= self.config.reserved_internal_tokens as usize {
            trace!("only reserved tokens left");
            return None;
        }
        let core_count = match self.core_span_len(shape) {
            Ok(count) => count,
            Err(reason) => {
                warn!(?shape, reason, "command shape cannot be served");
                return None;
            }
        };
        self.allocate_with(Origin::Host, shape, core_count)
    }

    pub(crate) fn allocate_with(
        &mut self,
        origin: Origin,
        shape: CommandShape,
        core_count: u16,
    ) -> Option<TokenId> {
        let id = self.registry.front(QueueKind::Free)?;
        self.registry.move_to(id, QueueKind::Active);
        let mut acquired = vec![Acquired::Token(id)];

        let pool_idx = self.core_pool_for(shape.class);
        let core = if core_count > 0 {
            match self.core[pool_idx].acquire_range(core_count, id) {
                Some(span) => {
                    acquired.push(Acquired::Core(pool_idx, span));
                    Some(span)
                }
                None => {
                    self.unwind(acquired, "core buffers");
                    return None;
                }
            }
        } else {
            None
        };

        let write = if shape.write_len > 0 {
            match self.write.acquire(id) {
                Some(buffer) => {
                    acquired.push(Acquired::Write(buffer));
                    Some(buffer)
                }
                None => {
                    self.unwind(acquired, "write buffer");
                    return None;
                }
            }
        } else {
            None
        };

        // Read buffers are bound at allocation only when completions name them.
        let read = if !self.config.mce_free && shape.read_len > 0 {
            let count = shape.read_len.div_ceil(self.config.pools.read_buffer_size) as u16;
            match self.read.claim_range(count, id) {
                Some(span) => Some(span),
                None => {
                    self.unwind(acquired, "read buffers");
                    return None;
                }
            }
        } else {
            None
        };

        let token = self.registry.get_mut(id)?;
        token.reset_for(origin, shape);
        token.core = core;
        token.write = write;
        token.read = read;
        trace!(token = id, ?origin, ?core, ?write, ?read, "token allocated");
        Some(id)
    }

    fn unwind(&mut self, acquired: Vec<Acquired>, exhausted: &'static str) {
        for step in acquired.into_iter().rev() {
            match step {
                Acquired::Write(buffer) => {
                    if let Err(err) = self.write.release(buffer) {
                        warn!(buffer, error = %err, "write buffer rollback failed");
                    }
                }
                Acquired::Core(pool, span) => {
                    if let Err(err) = self.core[pool].release_span(span) {
                        warn!(first = span.first, error = %err, "core buffer rollback failed");
                    }
                }
                Acquired::Token(id) => self.registry.move_to_front(id, QueueKind::Free),
            }
        }
        debug!(exhausted, "allocation rolled back");
    }

    fn core_pool_for(&self, class: TokenClass) -> usize {
        if self.core.len() > 1 {
            class.index()
        } else {
            0
        }
    }

    fn core_pool_of(&self, id: ResourceId) -> EngineResult<usize> {
        self.core
            .iter()
            .position(|pool| pool.contains(id))
            .ok_or_else(|| {
                EngineError::with_message(
                    EngineErrorKind::InvalidState,
                    format!("core buffer {id} belongs to no pool"),
                )
            })
    }

    fn core_span_len(&self, shape: CommandShape) -> Result<u16, &'static str> {
        let pools = &self.config.pools;
        if shape.write_len > pools.write_buffer_size {
            return Err("write length exceeds the write buffer");
        }
        if shape.read_len > 0 {
            let limit = if self.config.mce_free {
                pools.read_buffer_size
            } else {
                pools.read_buffer_size * self.read.capacity() as u32
            };
            if shape.read_len > limit {
                return Err("read length exceeds the read buffers");
            }
        }
        let len = shape.read_len.max(shape.write_len);
        if len == 0 {
            return Ok(0);
        }
        units_for_len(len).map_err(|_| "length exceeds the command unit field")?;
        let count = len.div_ceil(pools.core_buffer_size) as usize;
        if count > self.core[self.core_pool_for(shape.class)].capacity() {
            return Err("length exceeds the core buffer pool");
        }
        Ok(count as u16)
    }

    pub(crate) fn token_ref(&self, id: TokenId) -> EngineResult<&Token> {
        self.registry.get(id).ok_or_else(|| unknown_token(id))
    }

    pub(crate) fn token_mut(&mut self, id: TokenId) -> EngineResult<&mut Token> {
        self.registry.get_mut(id).ok_or_else(|| unknown_token(id))
    }

    /// Return a token to the free queue, or park it when it ended in timeout and
    /// the hold-failed policy is on.
    ///
    /// Releasing an in-flight token abandons its command with `Abort`.
    pub fn release(&mut self, id: TokenId) -> EngineResult<()> {
        let queue = self.registry.queue_of(id).ok_or_else(|| unknown_token(id))?;
        if queue != QueueKind::Free && self.token_ref(id)?.origin == Origin::Internal {
            return Err(EngineError::with_message(
                EngineErrorKind::InvalidToken,
                format!("token {id} carries an engine-issued command"),
            ));
        }
        match queue {
            QueueKind::Free => {
                return Err(EngineError::with_message(
                    EngineErrorKind::InvalidToken,
                    format!("token {id} is not allocated"),
                ))
            }
            QueueKind::TimedOut => {
                return Err(EngineError::with_message(
                    EngineErrorKind::InvalidState,
                    format!("token {id} is awaiting recovery or parked"),
                ))
            }
            QueueKind::Active => {
                let token = self.token_mut(id)?;
                token.outcome = token.outcome.escalate(Outcome::Abort);
                warn!(token = id, "releasing in-flight token");
            }
            QueueKind::Resumable => {}
        }
        self.release_inner(id)
    }

    pub(crate) fn release_inner(&mut self, id: TokenId) -> EngineResult<()> {
        self.early.retain(|early| *early != id);
        let (core, write, read, sequence, outcome) = {
            let token = self.token_mut(id)?;
            token.pending_release = None;
            token.retry = None;
            token.early_status = None;
            token.deadline = None;
            (
                token.core.take(),
                token.write.take(),
                token.read.take(),
                token.sequence.take(),
                token.outcome,
            )
        };
        if let Some(seq) = sequence {
            self.guard.retire(seq);
        }
        if let Some(span) = core {
            let pool = self.core_pool_of(span.first)?;
            self.core[pool].release_span(span)?;
        }
        if let Some(buffer) = write {
            self.write.release(buffer)?;
        }
        if let Some(span) = read {
            for buffer in span.ids() {
                self.read.schedule_dealloc(buffer)?;
            }
        }
        let hold = self.config.hold_failed_tokens && outcome == Outcome::Timeout;
        self.token_mut(id)?.held = hold;
        if hold {
            self.registry.move_to(id, QueueKind::TimedOut);
            debug!(token = id, "timed-out token parked");
        } else {
            self.registry.move_to(id, QueueKind::Free);
            trace!(token = id, ?outcome, "token released");
        }
        Ok(())
    }

    /// Return every parked token to the free queue.
    pub fn reclaim_held(&mut self) -> usize {
        let held: Vec<TokenId> = self
            .registry
            .iter(QueueKind::TimedOut)
            .filter(|id| self.registry.get(*id).is_some_and(|token| token.held))
            .collect();
        for id in &held {
            if let Some(token) = self.registry.get_mut(*id) {
                token.held = false;
            }
            self.registry.move_to(*id, QueueKind::Free);
        }
        if !held.is_empty() {
            debug!(count = held.len(), "parked tokens reclaimed");
        }
        held.len()
    }

    /// Move a host command and its buffers from `old` to a fresh token.
    ///
    /// `old` keeps its outcome but loses every binding; the caller releases it.
    /// The new token carries the command with toggled parity and is sent by the
    /// next [`Engine::reissue_pending`] pass.
    pub fn migrate(&mut self, old: TokenId) -> EngineResult<TokenId> {
        let queue = self.registry.queue_of(old).ok_or_else(|| unknown_token(old))?;
        let source = self.token_ref(old)?.clone();
        if !matches!(queue, QueueKind::Active | QueueKind::TimedOut)
            || source.held
            || source.origin != Origin::Host
        {
            return Err(EngineError::with_message(
                EngineErrorKind::InvalidToken,
                format!("token {old} cannot be migrated from {queue:?}"),
            ));
        }
        let new = self.registry.front(QueueKind::Free).ok_or_else(|| {
            EngineError::with_message(EngineErrorKind::Exhausted, "no free token to migrate to")
        })?;
        self.registry.move_to(new, QueueKind::Active);
        {
            let token = self.token_mut(new)?;
            token.reset_for(source.origin, source.shape);
            token.core = source.core;
            token.write = source.write;
            token.read = source.read;
            token.request = source.request;
            token.words = source.words;
            token.checksum = source.checksum;
            token.parity = !source.parity;
            token.counters = source.counters;
            token.retry = Some(RetryKind::AfterReset);
        }
        if let Some(span) = source.core {
            let pool = self.core_pool_of(span.first)?;
            for buffer in span.ids() {
                self.core[pool].transfer(buffer, new)?;
            }
        }
        if let Some(buffer) = source.write {
            self.write.transfer(buffer, new)?;
        }
        if let Some(span) = source.read {
            for buffer in span.ids() {
                self.read.transfer(buffer, new)?;
            }
        }
        {
            let token = self.token_mut(old)?;
            token.core = None;
            token.write = None;
            token.read = None;
        }
        self.early.retain(|early| *early != old);
        self.stats.migrations += 1;
        metrics::observe_migration();
        debug!(from = old, to = new, "token migrated");
        Ok(new)
    }

    /// Issue a host request on an allocated token. Returns its sequence number.
    pub fn issue(&mut self, id: TokenId, request: IoRequest) -> EngineResult<u64> {
        let queue = self.registry.queue_of(id).ok_or_else(|| unknown_token(id))?;
        let token = self.token_ref(id)?;
        if queue != QueueKind::Active || token.origin != Origin::Host || token.request.is_some() {
            return Err(EngineError::with_message(
                EngineErrorKind::InvalidToken,
                format!("token {id} is not awaiting a request"),
            ));
        }
        let shape = token.shape;
        let fits = match request.opcode {
            Opcode::Read => shape.read_len > 0,
            Opcode::Write => shape.write_len > 0 && token.write.is_some(),
            Opcode::Flush | Opcode::Admin => true,
            Opcode::ReleaseReadBuffer => false,
        };
        if !fits {
            return Err(EngineError::with_message(
                EngineErrorKind::InvalidToken,
                format!("token {id} was not allocated for {:?}", request.opcode),
            ));
        }
        self.token_mut(id)?.request = Some(request);
        match self.dispatch(id, false) {
            Ok(seq) => Ok(seq),
            Err(err) => {
                self.token_mut(id)?.request = None;
                Err(err)
            }
        }
    }

    /// Encode and post the token's current request, assigning a fresh sequence.
    pub(crate) fn dispatch(&mut self, id: TokenId, reissue: bool) -> EngineResult<u64> {
        let state = self.guard.state();
        let token = self.token_ref(id)?;
        let (origin, request, shape, parity, class) = (
            token.origin,
            token.request,
            token.shape,
            token.parity,
            token.class,
        );
        let (core, write, read) = (token.core, token.write, token.read);
        let previous = token.sequence;
        let permitted = match origin {
            Origin::Host => state.can_start_new_work(),
            Origin::Internal => state.can_issue_internal(),
        };
        if !permitted {
            return Err(EngineError::with_message(
                EngineErrorKind::NotPermitted,
                format!("run state {state:?} forbids issuing"),
            ));
        }
        // A reissued command no longer occupies its earlier sequence slot.
        if reissue {
            if let Some(previous) = previous {
                self.guard.retire(previous);
            }
        }
        // Internal release commands are not bound by the window.
        if origin == Origin::Host && !self.guard.window_open() {
            return Err(EngineError::new(EngineErrorKind::WindowFull));
        }
        let request = request.ok_or_else(|| {
            EngineError::with_message(
                EngineErrorKind::InvalidState,
                format!("token {id} has no request"),
            )
        })?;
        let len = match request.opcode {
            Opcode::Read => shape.read_len,
            Opcode::Write => shape.write_len,
            _ => 0,
        };
        let units = units_for_len(len).map_err(|err| {
            EngineError::with_message(EngineErrorKind::InvalidState, err.to_string())
        })?;
        let mut flags = CommandFlags::empty();
        flags.set(CommandFlags::PARITY, parity);
        flags.set(CommandFlags::FIRMWARE, class == TokenClass::Firmware);
        flags.set(CommandFlags::FUA, request.fua);

        let seq = self.guard.next_sequence();
        let command = Command {
            opcode: request.opcode,
            flags,
            token_id: id,
            seq_tag: seq as u16,
            units,
            arg: request.lba,
        };
        let words = command.encode();
        let hw_command = HwCommand {
            token: id,
            words,
            checksum: command_checksum(&words),
            core,
            write,
            read,
        };
        if let Err(err) = self.hw.issue(&hw_command) {
            self.guard.retire(seq);
            warn!(token = id, seq, error = %err, "command issue failed");
            return Err(EngineError::hardware("issue", &err));
        }

        let now = self.clock.now();
        let deadline = now + self.config.timeouts.for_state(state);
        let replaced = {
            let token = self.token_mut(id)?;
            token.words = words;
            token.checksum = hw_command.checksum;
            token.issued_at = Some(now);
            token.deadline = Some(deadline);
            token.outcome = Outcome::Active;
            token.retry = None;
            token.sequence.replace(seq)
        };
        if let Some(replaced) = replaced {
            self.guard.retire(replaced);
        }
        self.stats.issued += 1;
        if reissue {
            self.stats.reissued += 1;
        }
        metrics::observe_issue(reissue);
        trace!(token = id, seq, opcode = ?request.opcode, reissue, "command issued");
        Ok(seq)
    }

    /// Free a write's staging buffer once hardware has consumed the data.
    ///
    /// The command can no longer be replayed on another token afterwards.
    pub fn release_write_staging(&mut self, id: TokenId) -> EngineResult<()> {
        if self.registry.queue_of(id) != Some(QueueKind::Active) {
            return Err(EngineError::with_message(
                EngineErrorKind::InvalidToken,
                format!("token {id} is not active"),
            ));
        }
        let buffer = self.token_mut(id)?.write.take().ok_or_else(|| {
            EngineError::with_message(
                EngineErrorKind::InvalidState,
                format!("token {id} holds no write buffer"),
            )
        })?;
        self.write.release(buffer)?;
        debug!(token = id, buffer, "write staging released");
        Ok(())
    }

    /// Consume status completions from hardware.
    pub fn poll_status(&mut self) -> EngineResult<usize> {
        let completions = self
            .hw
            .read_status()
            .map_err(|err| EngineError::hardware("read status", &err))?;
        let count = completions.len();
        for completion in completions {
            self.apply_status(completion)?;
        }
        Ok(count)
    }

    fn apply_status(&mut self, completion: HwCompletion) -> EngineResult<()> {
        let id = completion.token;
        let live = self.registry.queue_of(id) == Some(QueueKind::Active)
            && self
                .registry
                .get(id)
                .and_then(|token| token.sequence)
                .is_some_and(|seq| seq as u16 == completion.seq_tag);
        if !live {
            self.stats.stale_completions += 1;
            debug!(
                token = id,
                seq_tag = completion.seq_tag,
                status = ?completion.status,
                "completion for no live command ignored"
            );
            return Ok(());
        }
        let outcome = completion.status.outcome();
        let mce_free = self.config.mce_free;
        let max_retries = self.config.recovery.max_retries;
        let can_retry = self.guard.can_start_new_work();
        let token = self
            .registry
            .get_mut(id)
            .ok_or_else(|| unknown_token(id))?;
        if token.origin == Origin::Internal {
            return self.finish(id, outcome);
        }
        match outcome {
            Outcome::Ok | Outcome::Warn if mce_free && token.is_read() && token.read.is_none() => {
                token.early_status = Some(outcome);
                if !self.early.contains(&id) {
                    self.early.push_back(id);
                }
                trace!(token = id, "read completed ahead of its data");
                Ok(())
            }
            Outcome::RecoverableFailure if token.counters.retries < max_retries && can_retry => {
                token.retry = Some(RetryKind::Recoverable);
                debug!(token = id, retries = token.counters.retries, "command will be retried");
                Ok(())
            }
            Outcome::RecoverableFailure => self.finish(id, Outcome::Abort),
            other => self.finish(id, other),
        }
    }

    /// Record a terminal outcome and hand the token to its owner.
    ///
    /// Internal release commands are settled and freed on the spot.
    pub(crate) fn finish(&mut self, id: TokenId, outcome: Outcome) -> EngineResult<()> {
        self.early.retain(|early| *early != id);
        let now = self.clock.now();
        let (origin, pending, sequence, latency, completion) = {
            let token = self.token_mut(id)?;
            token.outcome = if outcome.is_success() {
                outcome
            } else {
                token.outcome.escalate(outcome)
            };
            token.retry = None;
            token.early_status = None;
            token.deadline = None;
            let sequence = token.sequence.take();
            let latency = token.issued_at.map(|at| now.saturating_duration_since(at));
            let completion = Completion {
                token: id,
                outcome: token.outcome,
                tag: token.request.map_or(0, |request| request.tag),
                read: token.read,
                sequence,
            };
            (token.origin, token.pending_release, sequence, latency, completion)
        };
        if let Some(seq) = sequence {
            self.guard.retire(seq);
        }
        let final_outcome = completion.outcome;
        if final_outcome.is_success() {
            self.stats.completed_ok += 1;
        } else {
            self.stats.completed_failed += 1;
        }
        metrics::observe_completion(final_outcome, latency);
        self.registry.move_to(id, QueueKind::Resumable);

        if origin == Origin::Internal {
            if let Some(buffer) = pending {
                if !self.read.complete_release(buffer, id)? {
                    debug!(token = id, buffer, "release completed after the buffer was reclaimed");
                }
            }
            if !final_outcome.is_success() {
                warn!(token = id, buffer = ?pending, outcome = ?final_outcome, "read buffer release failed");
            }
            return self.release_inner(id);
        }

        debug!(token = id, outcome = ?final_outcome, "command completed");
        if let Some(hook) = self.hook.as_mut() {
            hook(&completion);
        }
        self.completions.push(completion);
        Ok(())
    }

    /// Move active tokens whose deadline passed to the timed-out queue, oldest
    /// deadline first.
    pub fn collect_expired(&mut self, now: Instant) -> Vec<TokenId> {
        let mut expired: Vec<(Instant, TokenId)> = self
            .registry
            .iter(QueueKind::Active)
            .filter_map(|id| {
                let deadline = self.registry.get(id)?.deadline?;
                (deadline <= now).then_some((deadline, id))
            })
            .collect();
        expired.sort_unstable();
        let ids: Vec<TokenId> = expired.into_iter().map(|(_, id)| id).collect();
        for &id in &ids {
            self.early.retain(|early| *early != id);
            if let Some(token) = self.registry.get_mut(id) {
                token.outcome = Outcome::Timeout;
                token.counters.timeouts += 1;
                token.retry = None;
                token.early_status = None;
                token.deadline = None;
                debug!(token = id, timeouts = token.counters.timeouts, "command timed out");
            }
            self.registry.move_to(id, QueueKind::TimedOut);
            self.stats.timeouts += 1;
            metrics::observe_timeout();
        }
        ids
    }

    /// Send a release command for every read buffer awaiting deallocation.
    pub fn send_read_releases(&mut self) -> EngineResult<usize> {
        let mut sent = 0;
        while let Some(buffer) = self.read.pop_dealloc() {
            if !self.guard.state().can_issue_internal() {
                self.read.requeue_dealloc(buffer);
                break;
            }
            let Some(id) = self.allocate_with(Origin::Internal, CommandShape::default(), 0) else {
                self.read.requeue_dealloc(buffer);
                debug!(buffer, "no token free for read buffer release");
                break;
            };
            {
                let token = self.token_mut(id)?;
                token.pending_release = Some(buffer);
                token.request = Some(IoRequest {
                    opcode: Opcode::ReleaseReadBuffer,
                    lba: buffer as u64,
                    fua: false,
                    tag: 0,
                });
            }
            match self.dispatch(id, false) {
                Ok(_) => {
                    let now = self.clock.now();
                    self.read.begin_release(buffer, id, now, self.config.mce_free)?;
                    self.stats.release_commands += 1;
                    sent += 1;
                    trace!(buffer, token = id, "read buffer release sent");
                }
                Err(err) => {
                    self.read.requeue_dealloc(buffer);
                    {
                        let token = self.token_mut(id)?;
                        token.pending_release = None;
                        token.outcome = Outcome::Abort;
                    }
                    self.release_inner(id)?;
                    debug!(buffer, error = %err, "read buffer release deferred");
                    break;
                }
            }
        }
        Ok(sent)
    }

    /// Re-issue tokens flagged for retry by status handling or reset recovery.
    pub fn reissue_pending(&mut self) -> EngineResult<usize> {
        let pending: Vec<(TokenId, RetryKind)> = self
            .registry
            .iter(QueueKind::Active)
            .filter_map(|id| Some((id, self.registry.get(id)?.retry?)))
            .collect();
        let mut reissued = 0;
        for (id, kind) in pending {
            if !self.guard.can_start_new_work() {
                break;
            }
            if kind == RetryKind::Recoverable {
                let token = self.token_mut(id)?;
                token.parity = !token.parity;
                token.counters.retries += 1;
                // Parity is flipped now; a deferred dispatch must not flip it again.
                token.retry = Some(RetryKind::AfterReset);
                self.stats.retries += 1;
            }
            match self.dispatch(id, true) {
                Ok(_) => {
                    self.token_mut(id)?.counters.reissues += 1;
                    reissued += 1;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        EngineErrorKind::WindowFull | EngineErrorKind::NotPermitted
                    ) =>
                {
                    debug!(token = id, error = %err, "reissue deferred");
                    break;
                }
                Err(err) => {
                    warn!(token = id, error = %err, "reissue failed");
                    self.finish(id, Outcome::Abort)?;
                }
            }
        }
        Ok(reissued)
    }

    /// One engine iteration: status, matches, timeouts, releases, retries.
    pub fn poll(&mut self) -> EngineResult<PollReport> {
        let mut report = PollReport::default();
        if self.guard.state() == RunState::Dead {
            return Ok(report);
        }
        report.status = self.poll_status()?;
        report.matched = self.drain_matches()?;
        let now = self.clock.now();
        let expired = self.collect_expired(now);
        report.expired = expired.len();
        if !expired.is_empty() {
            let policy = self.config.effective_policy();
            report.recovered = self.process_timeouts(policy, expired)?.len();
        }
        report.releases = self.send_read_releases()?;
        report.reissued = self.reissue_pending()?;
        metrics::record_depths(&self.counters());
        Ok(report)
    }

    pub fn counters(&self) -> EngineCounters {
        let held = self
            .registry
            .iter(QueueKind::TimedOut)
            .filter(|id| self.registry.get(*id).is_some_and(|token| token.held))
            .count();
        let stats = &self.stats;
        EngineCounters {
            run_state: self.guard.state(),
            free: self.registry.depth(QueueKind::Free),
            active: self.registry.depth(QueueKind::Active),
            timed_out: self.registry.depth(QueueKind::TimedOut),
            held,
            resumable: self.registry.depth(QueueKind::Resumable),
            early_completed: self.early.len(),
            outstanding_sequences: self.guard.outstanding(),
            core_available: self.core.iter().map(ResourcePool::available).sum(),
            write_available: self.write.available(),
            read_available: self.read.available(),
            read_awaiting_fill: self.read.awaiting_fill_len(),
            read_awaiting_dealloc: self.read.awaiting_dealloc_len(),
            holdoff_delay_us: self.holdoff.delay().as_micros() as u64,
            issued: stats.issued,
            reissued: stats.reissued,
            completed_ok: stats.completed_ok,
            completed_failed: stats.completed_failed,
            timeouts: stats.timeouts,
            resets: stats.resets,
            retries: stats.retries,
            migrations: stats.migrations,
            release_commands: stats.release_commands,
            inferred_releases: stats.inferred_releases,
            matches: stats.matches,
            first_attempt_matches: stats.first_attempt_matches,
            match_errors: stats.match_errors,
            watchdog_expiries: stats.watchdog_expiries,
            stale_legacy_accepts: stats.stale_legacy_accepts,
            stale_completions: stats.stale_completions,
        }
    }

    /// Log queue and pool state, at most once per diagnostic interval.
    pub fn dump_state(&mut self, reason: &str) {
        let now = self.clock.now();
        let Some(suppressed) = self.diag.allow(now) else {
            return;
        };
        let counters = self.counters();
        warn!(
            reason,
            suppressed,
            free = counters.free,
            active = counters.active,
            timed_out = counters.timed_out,
            resumable = counters.resumable,
            early_completed = counters.early_completed,
            fill_head = ?self.read.fill_head(),
            read_awaiting_fill = counters.read_awaiting_fill,
            read_awaiting_dealloc = counters.read_awaiting_dealloc,
            holdoff_delay_us = counters.holdoff_delay_us,
            oldest_sequence = self.guard.oldest_active_sequence(),
            "engine state dump"
        );
    }
}

fn unknown_token(id: TokenId) -> EngineError {
    EngineError::with_message(EngineErrorKind::InvalidToken, format!("unknown token {id}"))
}
