//! Fixed-capacity pools for the shared buffers of the csd accelerator.
//!
//! Every pool is created once with a fixed id range. Only ownership changes
//! afterwards: ids move between free and held, and read buffers additionally
//! cycle through the awaiting-fill and awaiting-deallocation queues.

mod free_set;
mod pool;
mod read;

use std::fmt;

pub use free_set::PoolStrategy;
pub use pool::{BufferSpan, ResourcePool};
pub use read::{ReadBufferPool, ReadBufferState};

/// Identifier of a buffer within its pool.
pub type ResourceId = u16;
/// Identifier of the token owning a buffer.
pub type OwnerId = u16;

pub type PoolResult<T> = core::result::Result<T, PoolError>;

/// Describes the failure category for pool operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolErrorKind {
    InvalidConfiguration,
    OutOfRange,
    NotHeld,
    InvalidState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolError {
    kind: PoolErrorKind,
    message: Option<String>,
}

impl PoolError {
    pub const fn new(kind: PoolErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> PoolErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {msg}", self.kind),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for PoolError {}
