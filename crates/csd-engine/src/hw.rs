use csd_pool::{BufferSpan, ResourceId};
use csd_proto::{CommandWords, MARKER_LEN};

use crate::token::{Outcome, TokenId};

/// Command as handed to the accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwCommand {
    pub token: TokenId,
    pub words: CommandWords,
    pub checksum: u32,
    pub core: Option<BufferSpan>,
    pub write: Option<ResourceId>,
    /// Read buffers bound up front. Empty in MCE-free mode.
    pub read: Option<BufferSpan>,
}

/// Per-command status reported by the accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwStatus {
    Ok,
    /// Completed with a non-fatal condition.
    Warn,
    /// Transfer checksum disagreed; the command may be retried.
    ChecksumMismatch,
    DeviceError,
    /// Media failure; never retried.
    MediaError,
}

impl HwStatus {
    pub fn outcome(self) -> Outcome {
        match self {
            HwStatus::Ok => Outcome::Ok,
            HwStatus::Warn => Outcome::Warn,
            HwStatus::ChecksumMismatch => Outcome::RecoverableFailure,
            HwStatus::DeviceError => Outcome::Abort,
            HwStatus::MediaError => Outcome::HardAbort,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwCompletion {
    pub token: TokenId,
    /// Sequence tag echoed from the completed command word.
    pub seq_tag: u16,
    pub status: HwStatus,
}

/// Accelerator interface consumed by the engine.
pub trait Hardware {
    /// Post a command to the command ring.
    fn issue(&mut self, command: &HwCommand) -> anyhow::Result<()>;

    /// Abort whatever the accelerator holds for `command.token`.
    fn reset(&mut self, command: &HwCommand) -> anyhow::Result<()>;

    /// Drain completions reported since the previous call.
    fn read_status(&mut self) -> anyhow::Result<Vec<HwCompletion>>;

    /// Snapshot the metadata marker of a read buffer.
    fn read_marker(&mut self, buffer: ResourceId) -> [u8; MARKER_LEN];
}
