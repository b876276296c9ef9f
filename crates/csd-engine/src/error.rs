use std::fmt;

use csd_pool::PoolError;

pub type EngineResult<T> = core::result::Result<T, EngineError>;

/// Describes the failure category for engine operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineErrorKind {
    InvalidConfiguration,
    /// Token id unknown or not in a queue that permits the operation.
    InvalidToken,
    /// Internal bookkeeping disagreed with itself.
    InvalidState,
    /// Run state forbids the operation.
    NotPermitted,
    /// Sequence window is full; retry after older commands retire.
    WindowFull,
    /// No free token or buffer.
    Exhausted,
    Hardware,
    /// A marker matched a token whose command cannot own read data.
    MatchMismatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineError {
    kind: EngineErrorKind,
    message: Option<String>,
}

impl EngineError {
    pub const fn new(kind: EngineErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub const fn kind(&self) -> EngineErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub(crate) fn hardware(context: &str, err: &anyhow::Error) -> Self {
        Self::with_message(EngineErrorKind::Hardware, format!("{context}: {err:#}"))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {msg}", self.kind),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        EngineError::with_message(EngineErrorKind::InvalidState, err.to_string())
    }
}
