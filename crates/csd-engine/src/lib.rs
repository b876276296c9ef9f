//! Command and token engine for the csd storage accelerator.
//!
//! Host commands ride on tokens drawn from a fixed registry. A token owns the
//! core, write and read buffers its command needs until it is released, moves
//! through the free, active, timed-out and resumable queues, and is recovered by
//! reset, migration or abort when its deadline passes. On MCE-free hardware the
//! engine also matches filled read buffers back to their commands by marker.

mod clock;
mod config;
mod diag;
mod engine;
mod error;
mod guard;
mod holdoff;
mod hw;
mod matcher;
pub mod metrics;
mod recovery;
mod registry;
pub mod sim;
mod token;
mod watchdog;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EngineConfig, HoldOffConfig, MatcherConfig, PoolConfig, RecoveryConfig, RecoveryPolicy,
    TimeoutConfig,
};
pub use diag::DiagLimiter;
pub use engine::{Completion, Engine, EngineCounters, PollReport};
pub use error::{EngineError, EngineErrorKind, EngineResult};
pub use guard::{RunGuard, RunState};
pub use holdoff::HoldOff;
pub use hw::{Hardware, HwCommand, HwCompletion, HwStatus};
pub use registry::{QueueKind, TokenRegistry};
pub use token::{CommandShape, IoRequest, Origin, Outcome, RecoveryCounters, Token, TokenClass, TokenId};
pub use watchdog::ProgressWatchdog;

#[cfg(test)]
mod proptests;
