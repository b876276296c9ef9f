use std::time::Instant;

use csd_pool::{BufferSpan, ResourceId};
use csd_proto::{CommandWords, Opcode};
use serde::Serialize;

/// Stable token identifier; also the token id field of the command word.
pub type TokenId = u16;

/// Routing class. Only matters when the core buffer pool is partitioned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TokenClass {
    #[default]
    Hardware,
    Firmware,
}

impl TokenClass {
    pub(crate) fn index(self) -> usize {
        match self {
            TokenClass::Hardware => 0,
            TokenClass::Firmware => 1,
        }
    }
}

/// Who issued the command a token carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Origin {
    #[default]
    Host,
    /// Read-buffer release issued by the engine itself.
    Internal,
}

/// Outcome of a token's current or last command.
///
/// Variants are ordered by severity, so recovery can only move a token up the
/// list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Warn,
    Active,
    Timeout,
    RecoverableFailure,
    Abort,
    HardAbort,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Outcome::Active | Outcome::Timeout | Outcome::RecoverableFailure
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Ok | Outcome::Warn)
    }

    /// The more severe of `self` and `next`.
    pub fn escalate(self, next: Outcome) -> Outcome {
        self.max(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Warn => "warn",
            Outcome::Active => "active",
            Outcome::Timeout => "timeout",
            Outcome::RecoverableFailure => "recoverable_failure",
            Outcome::Abort => "abort",
            Outcome::HardAbort => "hard_abort",
        }
    }
}

/// Resource needs of a command, given at allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandShape {
    pub class: TokenClass,
    pub read_len: u32,
    pub write_len: u32,
}

impl CommandShape {
    pub fn read(len: u32) -> Self {
        Self {
            read_len: len,
            ..Self::default()
        }
    }

    pub fn write(len: u32) -> Self {
        Self {
            write_len: len,
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: TokenClass) -> Self {
        self.class = class;
        self
    }
}

/// Host request issued on an allocated token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRequest {
    pub opcode: Opcode,
    pub lba: u64,
    pub fua: bool,
    /// Opaque cookie handed back in the completion.
    pub tag: u64,
}

impl IoRequest {
    pub fn read(lba: u64, tag: u64) -> Self {
        Self {
            opcode: Opcode::Read,
            lba,
            fua: false,
            tag,
        }
    }

    pub fn write(lba: u64, tag: u64) -> Self {
        Self {
            opcode: Opcode::Write,
            lba,
            fua: false,
            tag,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryCounters {
    pub resets: u32,
    pub retries: u32,
    pub timeouts: u32,
    pub reissues: u32,
}

/// Why a token is waiting for the retry pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryKind {
    /// Hardware was reset; parity was already flipped.
    AfterReset,
    /// Hardware reported a retryable failure.
    Recoverable,
}

/// Command slot state. Queue membership lives in the registry.
#[derive(Clone, Debug)]
pub struct Token {
    pub(crate) id: TokenId,
    pub(crate) class: TokenClass,
    pub(crate) origin: Origin,
    pub(crate) shape: CommandShape,
    pub(crate) core: Option<BufferSpan>,
    pub(crate) write: Option<ResourceId>,
    pub(crate) read: Option<BufferSpan>,
    pub(crate) pending_release: Option<ResourceId>,
    pub(crate) request: Option<IoRequest>,
    pub(crate) words: CommandWords,
    pub(crate) checksum: u32,
    pub(crate) parity: bool,
    pub(crate) outcome: Outcome,
    pub(crate) issued_at: Option<Instant>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) sequence: Option<u64>,
    pub(crate) counters: RecoveryCounters,
    pub(crate) retry: Option<RetryKind>,
    /// Status arrived before the read data was tied to a buffer.
    pub(crate) early_status: Option<Outcome>,
    /// Parked by the hold-failed policy.
    pub(crate) held: bool,
}

impl Token {
    pub(crate) fn new(id: TokenId) -> Self {
        Self {
            id,
            class: TokenClass::Hardware,
            origin: Origin::Host,
            shape: CommandShape::default(),
            core: None,
            write: None,
            read: None,
            pending_release: None,
            request: None,
            words: CommandWords::default(),
            checksum: 0,
            parity: false,
            outcome: Outcome::Ok,
            issued_at: None,
            deadline: None,
            sequence: None,
            counters: RecoveryCounters::default(),
            retry: None,
            early_status: None,
            held: false,
        }
    }

    /// Clear per-command state before the token is handed out again.
    pub(crate) fn reset_for(&mut self, origin: Origin, shape: CommandShape) {
        *self = Token {
            origin,
            class: shape.class,
            shape,
            outcome: Outcome::Active,
            ..Token::new(self.id)
        };
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn class(&self) -> TokenClass {
        self.class
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn shape(&self) -> CommandShape {
        self.shape
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn core(&self) -> Option<BufferSpan> {
        self.core
    }

    pub fn write_buffer(&self) -> Option<ResourceId> {
        self.write
    }

    pub fn read_buffer(&self) -> Option<BufferSpan> {
        self.read
    }

    pub fn pending_release(&self) -> Option<ResourceId> {
        self.pending_release
    }

    pub fn request(&self) -> Option<IoRequest> {
        self.request
    }

    pub fn words(&self) -> CommandWords {
        self.words
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn parity(&self) -> bool {
        self.parity
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn counters(&self) -> RecoveryCounters {
        self.counters
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn needs_retry(&self) -> bool {
        self.retry.is_some()
    }

    pub fn is_read(&self) -> bool {
        self.request.is_some_and(|req| req.opcode.is_read())
    }

    pub fn is_write(&self) -> bool {
        self.request.is_some_and(|req| req.opcode.is_write())
    }

    pub(crate) fn has_bindings(&self) -> bool {
        self.core.is_some()
            || self.write.is_some()
            || self.read.is_some()
            || self.pending_release.is_some()
    }
}
