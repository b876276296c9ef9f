use std::time::Duration;

use csd_pool::PoolStrategy;
use csd_proto::UNIT_BYTES;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineErrorKind, EngineResult};
use crate::guard::RunState;

/// What the engine does with a token whose deadline expired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Fail the token without touching hardware.
    Abort,
    /// Reset the command under the same token id and issue it again.
    #[default]
    ResetRetry,
    /// Move the command to a fresh token and issue it there.
    MigrateRetry,
    /// Fail everything in flight and shut the engine down.
    Die,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub core_buffers: u16,
    /// Core buffers reserved for firmware-routed tokens. Zero disables partitioning.
    pub firmware_core_buffers: u16,
    pub core_buffer_size: u32,
    pub write_buffers: u16,
    pub write_buffer_size: u32,
    pub read_buffers: u16,
    pub read_buffer_size: u32,
    pub strategy: PoolStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_buffers: 32,
            firmware_core_buffers: 0,
            core_buffer_size: 128 * 1024,
            write_buffers: 32,
            write_buffer_size: 128 * 1024,
            read_buffers: 32,
            read_buffer_size: 128 * 1024,
            strategy: PoolStrategy::Bitmap,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    pub policy: RecoveryPolicy,
    pub max_resets: u32,
    pub max_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policy: RecoveryPolicy::ResetRetry,
            max_resets: 3,
            max_retries: 3,
        }
    }
}

/// Command timeouts per run state, in microseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub initializing_us: u64,
    pub running_us: u64,
    pub draining_us: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initializing_us: 5_000_000,
            running_us: 2_000_000,
            draining_us: 500_000,
        }
    }
}

impl TimeoutConfig {
    pub fn for_state(&self, state: RunState) -> Duration {
        let us = match state {
            RunState::Initializing => self.initializing_us,
            RunState::Running => self.running_us,
            RunState::Draining | RunState::Terminating | RunState::Dead => self.draining_us,
        };
        Duration::from_micros(us)
    }
}

/// Adaptive delay between a read buffer's release and trusting its marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HoldOffConfig {
    pub initial_us: u64,
    pub floor_us: u64,
    pub ceiling_us: u64,
    pub climb_us: u64,
    pub drop_us: u64,
    pub cooldown_us: u64,
}

impl Default for HoldOffConfig {
    fn default() -> Self {
        Self {
            initial_us: 20,
            floor_us: 5,
            ceiling_us: 500,
            climb_us: 10,
            drop_us: 1,
            cooldown_us: 100_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherConfig {
    pub attempts: u32,
    pub retry_delay_us: u64,
    /// Accept legacy core-buffer markers on the final attempt.
    pub legacy_fallback: bool,
    pub watchdog_iterations: u64,
    pub watchdog_timeout_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            retry_delay_us: 2,
            legacy_fallback: true,
            watchdog_iterations: 100_000,
            watchdog_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub tokens: u16,
    /// Tokens host work may not take, kept for read-buffer release commands.
    pub reserved_internal_tokens: u16,
    /// Hardware reports completions without naming the read buffer used.
    pub mce_free: bool,
    /// Park tokens released with a timeout outcome instead of freeing them.
    pub hold_failed_tokens: bool,
    /// Any timeout terminates the engine regardless of `recovery.policy`.
    pub halt_on_timeout: bool,
    pub sequence_window: u64,
    pub diag_interval_ms: u64,
    pub pools: PoolConfig,
    pub recovery: RecoveryConfig,
    pub timeouts: TimeoutConfig,
    pub holdoff: HoldOffConfig,
    pub matcher: MatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tokens: 64,
            reserved_internal_tokens: 2,
            mce_free: true,
            hold_failed_tokens: false,
            halt_on_timeout: false,
            sequence_window: 1024,
            diag_interval_ms: 1_000,
            pools: PoolConfig::default(),
            recovery: RecoveryConfig::default(),
            timeouts: TimeoutConfig::default(),
            holdoff: HoldOffConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Policy applied to expired tokens, taking `halt_on_timeout` into account.
    pub fn effective_policy(&self) -> RecoveryPolicy {
        if self.halt_on_timeout {
            RecoveryPolicy::Die
        } else {
            self.recovery.policy
        }
    }

    pub fn partitioned(&self) -> bool {
        self.pools.firmware_core_buffers > 0
    }

    pub fn validate(&self) -> EngineResult<()> {
        let pools = &self.pools;
        if self.tokens < 2 {
            return Err(invalid("at least two tokens are required"));
        }
        if self.reserved_internal_tokens == 0 || self.reserved_internal_tokens >= self.tokens {
            return Err(invalid(
                "reserved_internal_tokens must be non-zero and below tokens",
            ));
        }
        if pools.core_buffers == 0 || pools.core_buffers > 256 {
            return Err(invalid("core_buffers must be within 1..=256"));
        }
        if pools.firmware_core_buffers >= pools.core_buffers {
            return Err(invalid("firmware_core_buffers must leave hardware buffers"));
        }
        if pools.write_buffers == 0 || pools.read_buffers == 0 {
            return Err(invalid("write and read pools must not be empty"));
        }
        for (name, size) in [
            ("core_buffer_size", pools.core_buffer_size),
            ("write_buffer_size", pools.write_buffer_size),
            ("read_buffer_size", pools.read_buffer_size),
        ] {
            if size == 0 || size % UNIT_BYTES != 0 {
                return Err(invalid(format!(
                    "{name} must be a non-zero multiple of {UNIT_BYTES}"
                )));
            }
        }
        if self.sequence_window == 0 {
            return Err(invalid("sequence_window must be non-zero"));
        }
        let holdoff = &self.holdoff;
        if holdoff.floor_us > holdoff.ceiling_us
            || holdoff.initial_us < holdoff.floor_us
            || holdoff.initial_us > holdoff.ceiling_us
        {
            return Err(invalid("holdoff requires floor <= initial <= ceiling"));
        }
        if holdoff.climb_us == 0 || holdoff.drop_us == 0 {
            return Err(invalid("holdoff climb and drop must be non-zero"));
        }
        if self.matcher.attempts == 0 {
            return Err(invalid("matcher attempts must be at least one"));
        }
        if self.matcher.watchdog_iterations == 0 || self.matcher.watchdog_timeout_ms == 0 {
            return Err(invalid("watchdog limits must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::with_message(EngineErrorKind::InvalidConfiguration, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"tokens": 8, "recovery": {"policy": "migrate_retry"}, "pools": {"strategy": "free_list"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.tokens, 8);
        assert_eq!(cfg.recovery.policy, RecoveryPolicy::MigrateRetry);
        assert_eq!(cfg.recovery.max_resets, 3);
        assert_eq!(cfg.pools.strategy, PoolStrategy::FreeList);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<EngineConfig>(r#"{"tokenz": 4}"#).unwrap_err();
        assert!(err.to_string().contains("tokenz"));
    }

    #[test]
    fn halt_on_timeout_overrides_policy() {
        let cfg = EngineConfig {
            halt_on_timeout: true,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.effective_policy(), RecoveryPolicy::Die);
    }

    #[test]
    fn rejects_inconsistent_holdoff() {
        let mut cfg = EngineConfig::default();
        cfg.holdoff.floor_us = 600;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::InvalidConfiguration);

        let mut cfg = EngineConfig::default();
        cfg.holdoff.climb_us = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unaligned_buffer_size() {
        let mut cfg = EngineConfig::default();
        cfg.pools.read_buffer_size = 1000;
        let err = cfg.validate().unwrap_err();
        assert!(err.message().unwrap().contains("read_buffer_size"));
    }

    #[test]
    fn timeout_follows_run_state() {
        let cfg = TimeoutConfig::default();
        assert_eq!(cfg.for_state(RunState::Running), Duration::from_secs(2));
        assert_eq!(
            cfg.for_state(RunState::Terminating),
            Duration::from_millis(500)
        );
    }
}
