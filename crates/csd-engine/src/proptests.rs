use std::time::Duration;

use proptest::prelude::*;

use crate::clock::ManualClock;
use crate::config::{EngineConfig, RecoveryPolicy};
use crate::engine::Engine;
use crate::hw::HwStatus;
use crate::registry::QueueKind;
use crate::sim::SimAccelerator;
use crate::token::{CommandShape, IoRequest, Origin, Outcome, TokenId};

type SimEngine = Engine<SimAccelerator, ManualClock>;

#[derive(Clone, Debug)]
enum Op {
    Allocate { read: bool, len: u32 },
    Issue(usize),
    Complete(usize, u8),
    Release(usize),
    Migrate(usize),
    Fill(usize),
    Expire,
    Poll,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<bool>(), 1u32..300_000).prop_map(|(read, len)| Op::Allocate { read, len }),
        3 => any::<usize>().prop_map(Op::Issue),
        2 => (any::<usize>(), 0u8..5).prop_map(|(pick, status)| Op::Complete(pick, status)),
        2 => any::<usize>().prop_map(Op::Release),
        1 => any::<usize>().prop_map(Op::Migrate),
        2 => any::<usize>().prop_map(Op::Fill),
        1 => Just(Op::Expire),
        2 => Just(Op::Poll),
    ]
}

fn policy() -> impl Strategy<Value = RecoveryPolicy> {
    prop_oneof![
        Just(RecoveryPolicy::Abort),
        Just(RecoveryPolicy::ResetRetry),
        Just(RecoveryPolicy::MigrateRetry),
        Just(RecoveryPolicy::Die),
    ]
}

fn build(mce_free: bool, hold_failed_tokens: bool, policy: RecoveryPolicy) -> SimEngine {
    let mut config = EngineConfig {
        tokens: 8,
        mce_free,
        hold_failed_tokens,
        ..EngineConfig::default()
    };
    config.pools.core_buffers = 4;
    config.pools.core_buffer_size = 64 * 1024;
    config.pools.write_buffers = 2;
    config.pools.read_buffers = 4;
    config.recovery.policy = policy;
    config.recovery.max_resets = 1;
    config.timeouts.running_us = 1_000_000;
    config.matcher.attempts = 2;
    let mut engine = Engine::new(config, SimAccelerator::new(), ManualClock::new()).unwrap();
    engine.start();
    engine
}

fn pick(ids: Vec<TokenId>, index: usize) -> Option<TokenId> {
    (!ids.is_empty()).then(|| ids[index % ids.len()])
}

fn filtered(
    engine: &SimEngine,
    queue: QueueKind,
    keep: impl Fn(&crate::token::Token) -> bool,
) -> Vec<TokenId> {
    engine
        .registry()
        .iter(queue)
        .filter(|id| engine.token(*id).is_some_and(&keep))
        .collect()
}

fn apply(engine: &mut SimEngine, op: Op) {
    match op {
        Op::Allocate { read, len } => {
            let shape = if read {
                CommandShape::read(len)
            } else {
                CommandShape::write(len)
            };
            engine.allocate(shape);
        }
        Op::Issue(index) => {
            let ready = filtered(engine, QueueKind::Active, |t| {
                t.origin() == Origin::Host && t.request().is_none()
            });
            if let Some(id) = pick(ready, index) {
                let shape = engine.token(id).unwrap().shape();
                let request = if shape.read_len > 0 {
                    IoRequest::read(id as u64, id as u64)
                } else {
                    IoRequest::write(id as u64, id as u64)
                };
                let _ = engine.issue(id, request);
            }
        }
        Op::Complete(index, status) => {
            let issued = filtered(engine, QueueKind::Active, |t| t.sequence().is_some());
            if let Some(id) = pick(issued, index) {
                let status = match status {
                    0 => HwStatus::Ok,
                    1 => HwStatus::Warn,
                    2 => HwStatus::ChecksumMismatch,
                    3 => HwStatus::DeviceError,
                    _ => HwStatus::MediaError,
                };
                engine.hardware_mut().complete(id, status);
                engine.poll_status().unwrap();
            }
        }
        Op::Release(index) => {
            let mut owned = filtered(engine, QueueKind::Resumable, |_| true);
            owned.extend(filtered(engine, QueueKind::Active, |t| {
                t.origin() == Origin::Host
            }));
            if let Some(id) = pick(owned, index) {
                engine.release(id).unwrap();
            }
        }
        Op::Migrate(index) => {
            let issued = filtered(engine, QueueKind::Active, |t| {
                t.origin() == Origin::Host && t.request().is_some()
            });
            if let Some(id) = pick(issued, index) {
                if engine.migrate(id).is_ok() {
                    engine.release(id).unwrap();
                }
            }
        }
        Op::Fill(index) => {
            if !engine.config().mce_free {
                return;
            }
            let waiting = filtered(engine, QueueKind::Active, |t| {
                t.is_read() && t.sequence().is_some() && t.read_buffer().is_none()
            });
            let head = engine.read_pool().fill_head();
            if let (Some(id), Some(head)) = (pick(waiting, index), head) {
                engine.hardware_mut().fill_command(head, id);
                engine.drain_matches().unwrap();
            }
        }
        Op::Expire => {
            engine.clock().advance(Duration::from_secs(2));
            engine.poll().unwrap();
        }
        Op::Poll => {
            engine.poll().unwrap();
        }
    }
}

fn check_invariants(engine: &SimEngine) {
    let registry = engine.registry();
    assert!(registry.check_partition());
    for id in 0..registry.len() as TokenId {
        let token = engine.token(id).unwrap();
        let queue = engine.queue_of(id).unwrap();
        assert_eq!(
            token.outcome() == Outcome::Active,
            queue == QueueKind::Active,
            "token {id} on {queue:?} has outcome {:?}",
            token.outcome()
        );
        if queue == QueueKind::Free {
            assert!(token.core().is_none());
            assert!(token.write_buffer().is_none());
            assert!(token.read_buffer().is_none());
        }
        if let Some(span) = token.core() {
            assert!(span.ids().all(|core| engine.core_owner(core) == Some(id)));
        }
        if let Some(buffer) = token.write_buffer() {
            assert_eq!(engine.write_pool().owner(buffer), Some(id));
        }
        if let Some(span) = token.read_buffer() {
            assert!(span.ids().all(|buffer| engine.read_pool().owner(buffer) == Some(id)));
        }
    }
    for pool in engine.core_pools() {
        for (core, owner) in pool.held() {
            let span = engine.token(owner).unwrap().core();
            assert!(span.is_some_and(|span| span.contains(core)), "core {core} owner {owner}");
        }
    }
    for (buffer, owner) in engine.write_pool().held() {
        assert_eq!(engine.token(owner).unwrap().write_buffer(), Some(buffer));
    }
    for buffer in 0..engine.read_pool().capacity() as u16 {
        if let Some(owner) = engine.read_pool().owner(buffer) {
            let span = engine.token(owner).unwrap().read_buffer();
            assert!(span.is_some_and(|span| span.contains(buffer)), "read {buffer} owner {owner}");
        }
    }
}

proptest! {
    #[test]
    fn queues_and_ownership_stay_consistent(
        mce_free in any::<bool>(),
        hold in any::<bool>(),
        policy in policy(),
        ops in prop::collection::vec(op(), 1..80),
    ) {
        let mut engine = build(mce_free, hold, policy);
        check_invariants(&engine);
        for op in ops {
            apply(&mut engine, op);
            check_invariants(&engine);
        }
    }

    #[test]
    fn reset_budget_bounds_reissues(budget in 0u32..4) {
        let mut config = EngineConfig { tokens: 4, mce_free: false, ..EngineConfig::default() };
        config.recovery.max_resets = budget;
        config.timeouts.running_us = 1_000;
        let mut engine = Engine::new(config, SimAccelerator::new(), ManualClock::new()).unwrap();
        engine.start();
        let id = engine.allocate(CommandShape::read(512)).unwrap();
        engine.issue(id, IoRequest::read(0, 1)).unwrap();

        let mut done = Vec::new();
        for _ in 0..=budget + 1 {
            engine.clock().advance(Duration::from_millis(2));
            engine.poll().unwrap();
            done.extend(engine.take_completions());
        }
        prop_assert_eq!(done.len(), 1);
        prop_assert_eq!(done[0].outcome, Outcome::Abort);
        prop_assert_eq!(engine.hardware().issue_count(id), budget as usize + 1);
        prop_assert_eq!(engine.hardware().resets().len(), budget as usize);
    }
}
