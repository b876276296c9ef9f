use tracing::trace;

use crate::free_set::{FreeSet, PoolStrategy};
use crate::{OwnerId, PoolError, PoolErrorKind, PoolResult, ResourceId};

/// Contiguous run of resource ids bound as a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSpan {
    pub first: ResourceId,
    pub count: u16,
}

impl BufferSpan {
    pub const fn single(id: ResourceId) -> Self {
        Self { first: id, count: 1 }
    }

    pub fn ids(&self) -> impl Iterator<Item = ResourceId> {
        let first = self.first;
        (0..self.count).map(move |offset| first + offset)
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        id >= self.first && id - self.first < self.count
    }
}

/// Fixed-size set of resource ids with single-owner tracking.
///
/// The `owners` table is the id→owner back-reference; it is written exactly when
/// an id is acquired, transferred or released and is never consulted to decide
/// whether an id is available.
pub struct ResourcePool {
    name: &'static str,
    base: ResourceId,
    free: FreeSet,
    owners: Vec<Option<OwnerId>>,
}

impl ResourcePool {
    pub fn new(
        name: &'static str,
        base: ResourceId,
        count: u16,
        strategy: PoolStrategy,
    ) -> PoolResult<Self> {
        if count == 0 {
            return Err(PoolError::with_message(
                PoolErrorKind::InvalidConfiguration,
                format!("{name} pool must hold at least one id"),
            ));
        }
        if base.checked_add(count - 1).is_none() {
            return Err(PoolError::with_message(
                PoolErrorKind::InvalidConfiguration,
                format!("{name} pool id range overflows"),
            ));
        }
        Ok(Self {
            name,
            base,
            free: FreeSet::new(strategy, count as usize),
            owners: vec![None; count as usize],
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> ResourceId {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.owners.len()
    }

    pub fn available(&self) -> usize {
        self.free.available()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.local(id).is_some()
    }

    pub fn is_free(&self, id: ResourceId) -> bool {
        self.local(id).is_some_and(|idx| self.free.is_free(idx))
    }

    /// Current owner of `id`, if any.
    pub fn owner(&self, id: ResourceId) -> Option<OwnerId> {
        self.local(id).and_then(|idx| self.owners[idx])
    }

    /// Acquire any free id on behalf of `owner`.
    pub fn acquire(&mut self, owner: OwnerId) -> Option<ResourceId> {
        let idx = self.free.take_any()?;
        self.owners[idx] = Some(owner);
        let id = self.global(idx);
        trace!(pool = self.name, id, owner, "acquire");
        Some(id)
    }

    /// Claim `count` contiguous ids as one unit.
    ///
    /// Each candidate start is claimed id by id; if any id in the run is taken the
    /// ids claimed during that attempt are returned in reverse order before the
    /// next start is tried.
    pub fn acquire_range(&mut self, count: u16, owner: OwnerId) -> Option<BufferSpan> {
        let count = count as usize;
        if count == 0 || count > self.capacity() || self.available() < count {
            return None;
        }
        for start in 0..=(self.capacity() - count) {
            let mut claimed = 0;
            while claimed < count && self.free.take(start + claimed) {
                claimed += 1;
            }
            if claimed == count {
                for idx in start..start + count {
                    self.owners[idx] = Some(owner);
                }
                let span = BufferSpan {
                    first: self.global(start),
                    count: count as u16,
                };
                trace!(pool = self.name, first = span.first, count, owner, "acquire range");
                return Some(span);
            }
            for idx in (start..start + claimed).rev() {
                self.free.put(idx);
            }
        }
        None
    }

    /// Release a held id. The owner entry is cleared before the id becomes free.
    pub fn release(&mut self, id: ResourceId) -> PoolResult<OwnerId> {
        let idx = self.require_local(id)?;
        let owner = self.owners[idx].take().ok_or_else(|| {
            PoolError::with_message(
                PoolErrorKind::NotHeld,
                format!("{} id {id} released while not held", self.name),
            )
        })?;
        self.free.put(idx);
        trace!(pool = self.name, id, owner, "release");
        Ok(owner)
    }

    /// Release every id of `span`, stopping at the first error.
    pub fn release_span(&mut self, span: BufferSpan) -> PoolResult<()> {
        for id in span.ids() {
            self.release(id)?;
        }
        Ok(())
    }

    /// Move ownership of a held id to another owner.
    pub fn transfer(&mut self, id: ResourceId, owner: OwnerId) -> PoolResult<()> {
        let idx = self.require_local(id)?;
        match self.owners[idx].as_mut() {
            Some(current) => {
                *current = owner;
                Ok(())
            }
            None => Err(PoolError::with_message(
                PoolErrorKind::NotHeld,
                format!("{} id {id} transferred while not held", self.name),
            )),
        }
    }

    /// Iterate over every held id and its owner.
    pub fn held(&self) -> impl Iterator<Item = (ResourceId, OwnerId)> + '_ {
        self.owners
            .iter()
            .enumerate()
            .filter_map(|(idx, owner)| owner.map(|owner| (self.global(idx), owner)))
    }

    /// Take a specific id out of the free set without recording an owner.
    pub(crate) fn claim_unowned(&mut self, id: ResourceId) -> bool {
        self.local(id).is_some_and(|idx| self.free.take(idx))
    }

    /// Record an owner for an id previously claimed with [`Self::claim_unowned`].
    pub(crate) fn bind(&mut self, id: ResourceId, owner: OwnerId) -> PoolResult<()> {
        let idx = self.require_local(id)?;
        if self.free.is_free(idx) || self.owners[idx].is_some() {
            return Err(PoolError::with_message(
                PoolErrorKind::InvalidState,
                format!("{} id {id} is not claimed-unowned", self.name),
            ));
        }
        self.owners[idx] = Some(owner);
        Ok(())
    }

    /// Drop the owner of a claimed id while keeping it out of the free set.
    pub(crate) fn unbind(&mut self, id: ResourceId) -> PoolResult<Option<OwnerId>> {
        let idx = self.require_local(id)?;
        Ok(self.owners[idx].take())
    }

    /// Return a claimed, unowned id to the free set.
    pub(crate) fn put_back(&mut self, id: ResourceId) -> PoolResult<()> {
        let idx = self.require_local(id)?;
        if self.owners[idx].is_some() {
            return Err(PoolError::with_message(
                PoolErrorKind::InvalidState,
                format!("{} id {id} still owned", self.name),
            ));
        }
        if !self.free.put(idx) {
            return Err(PoolError::with_message(
                PoolErrorKind::InvalidState,
                format!("{} id {id} already free", self.name),
            ));
        }
        Ok(())
    }

    fn local(&self, id: ResourceId) -> Option<usize> {
        let idx = id.checked_sub(self.base)? as usize;
        (idx < self.owners.len()).then_some(idx)
    }

    fn require_local(&self, id: ResourceId) -> PoolResult<usize> {
        self.local(id).ok_or_else(|| {
            PoolError::with_message(
                PoolErrorKind::OutOfRange,
                format!("{} id {id} out of range", self.name),
            )
        })
    }

    fn global(&self, idx: usize) -> ResourceId {
        self.base + idx as ResourceId
    }
}
