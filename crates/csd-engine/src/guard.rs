use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

/// Lifecycle of the surrounding engine as seen by the command core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Running,
    Draining,
    Terminating,
    Dead,
}

impl RunState {
    /// New host work, resets and reissues are only allowed while running.
    pub fn can_start_new_work(self) -> bool {
        matches!(self, RunState::Running)
    }

    /// Housekeeping commands may still go out while draining.
    pub fn can_issue_internal(self) -> bool {
        matches!(self, RunState::Running | RunState::Draining)
    }

    pub fn is_terminating(self) -> bool {
        matches!(self, RunState::Terminating | RunState::Dead)
    }

    fn can_transition_to(self, next: RunState) -> bool {
        match self {
            RunState::Dead => false,
            RunState::Terminating => matches!(next, RunState::Dead),
            _ => true,
        }
    }
}

/// Run state plus the sequence window bounding command run-ahead.
#[derive(Debug)]
pub struct RunGuard {
    state: RunState,
    next: u64,
    outstanding: BTreeSet<u64>,
    window: u64,
}

impl RunGuard {
    pub fn new(window: u64) -> Self {
        Self {
            state: RunState::Initializing,
            next: 0,
            outstanding: BTreeSet::new(),
            window,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn can_start_new_work(&self) -> bool {
        self.state.can_start_new_work()
    }

    pub fn is_terminating(&self) -> bool {
        self.state.is_terminating()
    }

    /// Apply a run-state transition. Leaving terminating for anything but dead is refused.
    pub fn set_state(&mut self, next: RunState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "run state transition refused");
            return false;
        }
        info!(from = ?self.state, to = ?next, "run state transition");
        self.state = next;
        true
    }

    /// Sequence the next command will receive.
    pub fn peek_sequence(&self) -> u64 {
        self.next
    }

    /// Hand out a sequence number and track it until retired.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        self.outstanding.insert(seq);
        seq
    }

    /// Oldest sequence still outstanding, or the next one when none are.
    pub fn oldest_active_sequence(&self) -> u64 {
        self.outstanding.first().copied().unwrap_or(self.next)
    }

    pub fn window_open(&self) -> bool {
        self.next - self.oldest_active_sequence() < self.window
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn retire(&mut self, seq: u64) -> bool {
        self.outstanding.remove(&seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_post_increment() {
        let mut guard = RunGuard::new(4);
        assert_eq!(guard.next_sequence(), 0);
        assert_eq!(guard.next_sequence(), 1);
        assert_eq!(guard.peek_sequence(), 2);
        assert_eq!(guard.oldest_active_sequence(), 0);
    }

    #[test]
    fn window_tracks_oldest_outstanding() {
        let mut guard = RunGuard::new(3);
        let a = guard.next_sequence();
        guard.next_sequence();
        guard.next_sequence();
        assert!(!guard.window_open());
        // Retiring a younger command does not move the window.
        assert!(guard.retire(1));
        assert!(!guard.window_open());
        assert!(guard.retire(a));
        assert_eq!(guard.oldest_active_sequence(), 2);
        assert!(guard.window_open());
        guard.retire(2);
        assert_eq!(guard.oldest_active_sequence(), 3);
    }

    #[test]
    fn terminating_only_leads_to_dead() {
        let mut guard = RunGuard::new(1);
        assert!(!guard.can_start_new_work());
        assert!(guard.set_state(RunState::Running));
        assert!(guard.can_start_new_work());
        assert!(guard.set_state(RunState::Terminating));
        assert!(!guard.set_state(RunState::Running));
        assert!(guard.is_terminating());
        assert!(guard.set_state(RunState::Dead));
        assert!(!guard.set_state(RunState::Initializing));
    }

    #[test]
    fn draining_allows_only_internal_commands() {
        assert!(!RunState::Draining.can_start_new_work());
        assert!(RunState::Draining.can_issue_internal());
        assert!(!RunState::Terminating.can_issue_internal());
    }
}
