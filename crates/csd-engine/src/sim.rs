//! Scripted stand-in for the accelerator.
//!
//! In manual mode nothing happens on its own: tests queue completions and
//! write markers explicitly. In auto mode every command completes on the next
//! status read, and MCE-free reads fill posted read buffers in FIFO order the
//! way the device does.

use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail};
use csd_pool::ResourceId;
use csd_proto::{encode_command_marker, Command, Opcode, MARKER_LEN};
use tracing::trace;

use crate::hw::{Hardware, HwCommand, HwCompletion, HwStatus};
use crate::token::TokenId;

#[derive(Debug, Default)]
struct AutoMode {
    /// Read buffers posted to the device, in fill order.
    posted: VecDeque<ResourceId>,
    /// MCE-free reads waiting for a posted buffer.
    waiting: VecDeque<HwCommand>,
    /// Complete release commands only implicitly, through refills.
    silent_releases: bool,
}

#[derive(Debug, Default)]
pub struct SimAccelerator {
    issued: Vec<HwCommand>,
    resets: Vec<HwCommand>,
    pending: VecDeque<HwCompletion>,
    markers: HashMap<ResourceId, VecDeque<[u8; MARKER_LEN]>>,
    marker_reads: usize,
    fail_issue: usize,
    fail_reset: usize,
    drop_issue: usize,
    auto: Option<AutoMode>,
}

impl SimAccelerator {
    /// Manual mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Auto-completing device with `read_buffers` posted at start.
    pub fn auto(read_buffers: u16) -> Self {
        Self {
            auto: Some(AutoMode {
                posted: (0..read_buffers).collect(),
                ..AutoMode::default()
            }),
            ..Self::default()
        }
    }

    /// Leave release commands unacknowledged in auto mode.
    pub fn with_silent_releases(mut self) -> Self {
        if let Some(auto) = self.auto.as_mut() {
            auto.silent_releases = true;
        }
        self
    }

    pub fn issued(&self) -> &[HwCommand] {
        &self.issued
    }

    pub fn resets(&self) -> &[HwCommand] {
        &self.resets
    }

    /// Number of commands posted for `token`.
    pub fn issue_count(&self, token: TokenId) -> usize {
        self.issued.iter().filter(|cmd| cmd.token == token).count()
    }

    pub fn last_issued(&self, token: TokenId) -> Option<&HwCommand> {
        self.issued.iter().rev().find(|cmd| cmd.token == token)
    }

    pub fn marker_reads(&self) -> usize {
        self.marker_reads
    }

    pub fn fail_next_issue(&mut self, count: usize) {
        self.fail_issue = count;
    }

    pub fn fail_next_reset(&mut self, count: usize) {
        self.fail_reset = count;
    }

    /// Accept the next `count` commands without ever completing them.
    pub fn drop_next_issue(&mut self, count: usize) {
        self.drop_issue = count;
    }

    /// Queue a completion for the most recent command of `token`.
    pub fn complete(&mut self, token: TokenId, status: HwStatus) {
        let seq_tag = self.last_issued(token).map_or(0, seq_tag);
        self.pending.push_back(HwCompletion {
            token,
            seq_tag,
            status,
        });
    }

    /// Replace the marker of `buffer`.
    pub fn set_marker(&mut self, buffer: ResourceId, marker: [u8; MARKER_LEN]) {
        self.markers.insert(buffer, VecDeque::from([marker]));
    }

    /// Markers returned by successive reads of `buffer`; the last one sticks.
    pub fn script_markers(&mut self, buffer: ResourceId, markers: Vec<[u8; MARKER_LEN]>) {
        self.markers.insert(buffer, markers.into());
    }

    /// Fill `buffer` with the full-command marker of the last command of `token`.
    pub fn fill_command(&mut self, buffer: ResourceId, token: TokenId) {
        if let Some(cmd) = self.last_issued(token).copied() {
            self.set_marker(buffer, encode_command_marker(cmd.words));
        }
    }

    fn on_auto_issue(&mut self, command: HwCommand) {
        let Some(auto) = self.auto.as_mut() else {
            return;
        };
        let ok = HwCompletion {
            token: command.token,
            seq_tag: seq_tag(&command),
            status: HwStatus::Ok,
        };
        match Command::decode(command.words).map(|cmd| (cmd.opcode, cmd.arg)) {
            Ok((Opcode::Read, _)) if command.read.is_none() => {
                auto.waiting.push_back(command);
            }
            Ok((Opcode::ReleaseReadBuffer, buffer)) => {
                auto.posted.push_back(buffer as ResourceId);
                if !auto.silent_releases {
                    self.pending.push_back(ok);
                }
            }
            _ => self.pending.push_back(ok),
        }
        self.pump();
    }

    /// Fill posted buffers for waiting reads and report them done.
    fn pump(&mut self) {
        let Some(auto) = self.auto.as_mut() else {
            return;
        };
        while !auto.waiting.is_empty() && !auto.posted.is_empty() {
            let (Some(read), Some(buffer)) = (auto.waiting.pop_front(), auto.posted.pop_front())
            else {
                break;
            };
            trace!(token = read.token, buffer, "sim filled read buffer");
            self.markers
                .insert(buffer, VecDeque::from([encode_command_marker(read.words)]));
            self.pending.push_back(HwCompletion {
                token: read.token,
                seq_tag: seq_tag(&read),
                status: HwStatus::Ok,
            });
        }
    }
}

fn seq_tag(command: &HwCommand) -> u16 {
    Command::decode(command.words).map_or(0, |cmd| cmd.seq_tag)
}

impl Hardware for SimAccelerator {
    fn issue(&mut self, command: &HwCommand) -> anyhow::Result<()> {
        if self.fail_issue > 0 {
            self.fail_issue -= 1;
            bail!("command ring full");
        }
        self.issued.push(*command);
        if self.drop_issue > 0 {
            self.drop_issue -= 1;
            return Ok(());
        }
        self.on_auto_issue(*command);
        Ok(())
    }

    fn reset(&mut self, command: &HwCommand) -> anyhow::Result<()> {
        if self.fail_reset > 0 {
            self.fail_reset -= 1;
            return Err(anyhow!("reset of token {} rejected", command.token));
        }
        self.resets.push(*command);
        if let Some(auto) = self.auto.as_mut() {
            auto.waiting.retain(|read| read.token != command.token);
        }
        Ok(())
    }

    fn read_status(&mut self) -> anyhow::Result<Vec<HwCompletion>> {
        Ok(self.pending.drain(..).collect())
    }

    fn read_marker(&mut self, buffer: ResourceId) -> [u8; MARKER_LEN] {
        self.marker_reads += 1;
        match self.markers.get_mut(&buffer) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or([0; MARKER_LEN]),
            Some(script) => script.front().copied().unwrap_or([0; MARKER_LEN]),
            None => [0; MARKER_LEN],
        }
    }
}
