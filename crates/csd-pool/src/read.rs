use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace};

use crate::free_set::PoolStrategy;
use crate::pool::{BufferSpan, ResourcePool};
use crate::{OwnerId, PoolError, PoolErrorKind, PoolResult, ResourceId};

/// Ownership state of one read (completion) buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadBufferState {
    /// Not posted to hardware and not bound.
    Free,
    /// Posted to hardware; it will be filled in FIFO order.
    AwaitingFill,
    /// Bound to a token.
    Held(OwnerId),
    /// Contents consumed; a release command still has to be sent.
    AwaitingDealloc,
    /// Release command sent; the buffer returns to free when it completes.
    Releasing,
}

/// Read buffer pool with the awaiting-fill and awaiting-deallocation queues.
pub struct ReadBufferPool {
    pool: ResourcePool,
    states: Vec<ReadBufferState>,
    awaiting_fill: VecDeque<ResourceId>,
    awaiting_dealloc: VecDeque<ResourceId>,
    last_release: Vec<Option<Instant>>,
    release_owner: Vec<Option<OwnerId>>,
}

impl ReadBufferPool {
    pub fn new(count: u16, strategy: PoolStrategy) -> PoolResult<Self> {
        let pool = ResourcePool::new("read", 0, count, strategy)?;
        let count = count as usize;
        Ok(Self {
            pool,
            states: vec![ReadBufferState::Free; count],
            awaiting_fill: VecDeque::with_capacity(count),
            awaiting_dealloc: VecDeque::with_capacity(count),
            last_release: vec![None; count],
            release_owner: vec![None; count],
        })
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }

    pub fn awaiting_fill_len(&self) -> usize {
        self.awaiting_fill.len()
    }

    pub fn awaiting_dealloc_len(&self) -> usize {
        self.awaiting_dealloc.len()
    }

    pub fn awaiting_fill(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.awaiting_fill.iter().copied()
    }

    pub fn state(&self, id: ResourceId) -> Option<ReadBufferState> {
        self.states.get(id as usize).copied()
    }

    pub fn owner(&self, id: ResourceId) -> Option<OwnerId> {
        self.pool.owner(id)
    }

    /// When the most recent release command for `id` was sent.
    pub fn last_release(&self, id: ResourceId) -> Option<Instant> {
        self.last_release.get(id as usize).copied().flatten()
    }

    /// Token carrying the outstanding release command for `id`, if any.
    pub fn release_owner(&self, id: ResourceId) -> Option<OwnerId> {
        self.release_owner.get(id as usize).copied().flatten()
    }

    /// Post every free buffer to hardware in id order.
    pub fn arm_all(&mut self) -> usize {
        let mut armed = 0;
        for idx in 0..self.states.len() {
            let id = idx as ResourceId;
            if self.states[idx] == ReadBufferState::Free && self.pool.claim_unowned(id) {
                self.states[idx] = ReadBufferState::AwaitingFill;
                self.awaiting_fill.push_back(id);
                armed += 1;
            }
        }
        debug!(armed, "read buffers posted");
        armed
    }

    /// The buffer hardware is expected to fill next.
    pub fn fill_head(&self) -> Option<ResourceId> {
        self.awaiting_fill.front().copied()
    }

    /// Bind the awaiting-fill head to `owner`.
    pub fn claim_head(&mut self, owner: OwnerId) -> PoolResult<ResourceId> {
        let id = self.awaiting_fill.pop_front().ok_or_else(|| {
            PoolError::with_message(PoolErrorKind::InvalidState, "no read buffer awaiting fill")
        })?;
        self.pool.bind(id, owner)?;
        self.states[id as usize] = ReadBufferState::Held(owner);
        trace!(id, owner, "read buffer claimed");
        Ok(id)
    }

    /// Take the awaiting-fill head without an owner and queue it for release.
    ///
    /// Any release command still outstanding for the buffer is forgotten; its
    /// later completion no longer touches the buffer.
    pub fn force_claim_head(&mut self) -> Option<ResourceId> {
        let id = self.awaiting_fill.pop_front()?;
        if let Some(stale) = self.release_owner[id as usize].take() {
            debug!(id, release_owner = stale, "dropping outstanding release on force-claim");
        }
        self.states[id as usize] = ReadBufferState::AwaitingDealloc;
        self.awaiting_dealloc.push_back(id);
        debug!(id, "read buffer force-claimed");
        Some(id)
    }

    /// Bind a contiguous range of free (unposted) buffers to `owner`.
    pub fn claim_range(&mut self, count: u16, owner: OwnerId) -> Option<BufferSpan> {
        let span = self.pool.acquire_range(count, owner)?;
        for id in span.ids() {
            self.states[id as usize] = ReadBufferState::Held(owner);
        }
        Some(span)
    }

    /// Move ownership of a held buffer to another token.
    pub fn transfer(&mut self, id: ResourceId, owner: OwnerId) -> PoolResult<()> {
        self.require_held(id)?;
        self.pool.transfer(id, owner)?;
        self.states[id as usize] = ReadBufferState::Held(owner);
        Ok(())
    }

    /// Unbind a held buffer and queue it for its release command.
    pub fn schedule_dealloc(&mut self, id: ResourceId) -> PoolResult<OwnerId> {
        let owner = self.require_held(id)?;
        self.pool.unbind(id)?;
        self.states[id as usize] = ReadBufferState::AwaitingDealloc;
        self.awaiting_dealloc.push_back(id);
        Ok(owner)
    }

    pub fn pop_dealloc(&mut self) -> Option<ResourceId> {
        self.awaiting_dealloc.pop_front()
    }

    /// Put back a buffer whose release command could not be sent.
    pub fn requeue_dealloc(&mut self, id: ResourceId) {
        self.awaiting_dealloc.push_front(id);
    }

    /// Record that a release command for `id` was sent by `release_owner`.
    ///
    /// With `rearm` the buffer goes straight back to the awaiting-fill tail:
    /// hardware processes the release before any later fill of the same buffer.
    pub fn begin_release(
        &mut self,
        id: ResourceId,
        release_owner: OwnerId,
        now: Instant,
        rearm: bool,
    ) -> PoolResult<()> {
        self.require_state(id, ReadBufferState::AwaitingDealloc)?;
        let idx = id as usize;
        self.last_release[idx] = Some(now);
        self.release_owner[idx] = Some(release_owner);
        if rearm {
            self.states[idx] = ReadBufferState::AwaitingFill;
            self.awaiting_fill.push_back(id);
        } else {
            self.states[idx] = ReadBufferState::Releasing;
        }
        Ok(())
    }

    /// The release command `release_owner` sent for `id` finished (signalled or
    /// inferred). Returns false when that command no longer owns the release.
    pub fn complete_release(
        &mut self,
        id: ResourceId,
        release_owner: OwnerId,
    ) -> PoolResult<bool> {
        let idx = id as usize;
        if idx >= self.states.len() {
            return Err(PoolError::with_message(
                PoolErrorKind::OutOfRange,
                format!("read id {id} out of range"),
            ));
        }
        if self.release_owner[idx] != Some(release_owner) {
            let current = self.release_owner[idx];
            trace!(id, release_owner, ?current, "stale release completion");
            return Ok(false);
        }
        self.release_owner[idx] = None;
        if self.states[idx] == ReadBufferState::Releasing {
            self.pool.put_back(id)?;
            self.states[idx] = ReadBufferState::Free;
        }
        Ok(true)
    }

    fn require_held(&self, id: ResourceId) -> PoolResult<OwnerId> {
        match self.state(id) {
            Some(ReadBufferState::Held(owner)) => Ok(owner),
            Some(other) => Err(PoolError::with_message(
                PoolErrorKind::NotHeld,
                format!("read id {id} is {other:?}, not held"),
            )),
            None => Err(PoolError::with_message(
                PoolErrorKind::OutOfRange,
                format!("read id {id} out of range"),
            )),
        }
    }

    fn require_state(&self, id: ResourceId, expected: ReadBufferState) -> PoolResult<()> {
        match self.state(id) {
            Some(state) if state == expected => Ok(()),
            Some(state) => Err(PoolError::with_message(
                PoolErrorKind::InvalidState,
                format!("read id {id} is {state:?}, expected {expected:?}"),
            )),
            None => Err(PoolError::with_message(
                PoolErrorKind::OutOfRange,
                format!("read id {id} out of range"),
            )),
        }
    }
}
