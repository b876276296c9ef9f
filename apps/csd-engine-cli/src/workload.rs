use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use csd_engine::{
    sim::SimAccelerator, CommandShape, Engine, EngineConfig, EngineCounters, EngineErrorKind,
    IoRequest, RunState, SystemClock,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

const SECTOR_BYTES: u32 = 512;
const IDLE_BACKOFF: Duration = Duration::from_micros(200);

pub type SimEngine = Engine<SimAccelerator, SystemClock>;

/// Random read/write mix sized to fit the configured buffers.
#[derive(Debug)]
pub struct Workload {
    rng: StdRng,
    ops: u64,
    read_percent: u8,
    max_sectors: u32,
    next_lba: u64,
}

impl Workload {
    pub fn new(config: &EngineConfig, ops: u64, seed: u64, read_percent: u8) -> Self {
        let pools = &config.pools;
        let limit = pools
            .core_buffer_size
            .min(pools.write_buffer_size)
            .min(pools.read_buffer_size);
        Self {
            rng: StdRng::seed_from_u64(seed),
            ops,
            read_percent: read_percent.min(100),
            max_sectors: (limit / SECTOR_BYTES).max(1),
            next_lba: 0,
        }
    }

    pub fn ops(&self) -> u64 {
        self.ops
    }

    fn next(&mut self, tag: u64) -> (CommandShape, IoRequest) {
        let sectors = self.rng.gen_range(1..=self.max_sectors);
        let len = sectors * SECTOR_BYTES;
        let lba = self.next_lba;
        self.next_lba = self.next_lba.wrapping_add(u64::from(sectors));
        if self.rng.gen_range(0..100u8) < self.read_percent {
            (CommandShape::read(len), IoRequest::read(lba, tag))
        } else {
            (CommandShape::write(len), IoRequest::write(lba, tag))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub submitted: u64,
    pub finished: u64,
    pub failed: u64,
    pub interrupted: bool,
    pub counters: EngineCounters,
}

pub fn build_engine(config: EngineConfig) -> Result<SimEngine> {
    let read_buffers = if config.mce_free {
        config.pools.read_buffers
    } else {
        0
    };
    let mut engine = Engine::new(config, SimAccelerator::auto(read_buffers), SystemClock)
        .context("init engine")?;
    engine.start();
    Ok(engine)
}

/// Submit and retire commands until the workload is exhausted or `stop` is raised,
/// then drain in-flight work and shut the engine down.
pub fn drive(
    engine: &mut SimEngine,
    workload: &mut Workload,
    stop: &AtomicBool,
) -> Result<RunSummary> {
    let mut submitted = 0u64;
    let mut finished = 0u64;
    let mut failed = 0u64;
    let mut deferred: Option<(CommandShape, IoRequest)> = None;
    let mut interrupted = false;

    loop {
        if stop.load(Ordering::Relaxed) && !interrupted {
            interrupted = true;
            info!(submitted, finished, "stop requested; draining engine");
            engine.set_run_state(RunState::Draining);
        }

        while submitted < workload.ops() && engine.run_state().can_start_new_work() {
            let (shape, request) = deferred.take().unwrap_or_else(|| workload.next(submitted));
            let Some(id) = engine.allocate(shape) else {
                deferred = Some((shape, request));
                break;
            };
            match engine.issue(id, request) {
                Ok(sequence) => {
                    debug!(token = id, sequence, ?shape, "submitted");
                    submitted += 1;
                }
                Err(err) if err.kind() == EngineErrorKind::WindowFull => {
                    engine.release(id).context("return deferred token")?;
                    deferred = Some((shape, request));
                    break;
                }
                Err(err) => return Err(err).context("issue command"),
            }
        }

        let report = engine.poll().context("poll engine")?;
        let done = engine.take_completions();
        let progressed = !done.is_empty();
        for completion in done {
            if !completion.outcome.is_success() {
                failed += 1;
                warn!(
                    token = completion.token,
                    tag = completion.tag,
                    outcome = completion.outcome.as_str(),
                    "command failed"
                );
            }
            engine.release(completion.token).context("release token")?;
            finished += 1;
        }

        let quiesced = finished == submitted
            && (submitted == workload.ops() || !engine.run_state().can_start_new_work());
        if quiesced || engine.run_state().is_terminating() {
            break;
        }
        if report.is_idle() && !progressed {
            thread::sleep(IDLE_BACKOFF);
        }
    }

    // Flush the read-buffer releases queued by the last completions.
    if !engine.run_state().is_terminating() {
        engine.set_run_state(RunState::Draining);
        for _ in 0..3 {
            if engine.poll().context("drain engine")?.is_idle() {
                break;
            }
        }
    }
    engine.set_run_state(RunState::Terminating);
    engine.set_run_state(RunState::Dead);

    let counters = engine.counters();
    info!(
        submitted,
        finished,
        failed,
        issued = counters.issued,
        matches = counters.matches,
        timeouts = counters.timeouts,
        "workload finished"
    );
    Ok(RunSummary {
        submitted,
        finished,
        failed,
        interrupted,
        counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(config: EngineConfig, ops: u64) -> RunSummary {
        let mut workload = Workload::new(&config, ops, 7, 60);
        let mut engine = build_engine(config).unwrap();
        drive(&mut engine, &mut workload, &AtomicBool::new(false)).unwrap()
    }

    #[test]
    fn workload_fits_buffers() {
        let mut config = EngineConfig::default();
        config.pools.read_buffer_size = 4096;
        let mut workload = Workload::new(&config, 100, 1, 50);
        for tag in 0..100 {
            let (shape, request) = workload.next(tag);
            assert!(shape.read_len.max(shape.write_len) <= 4096);
            assert_eq!(request.tag, tag);
        }
    }

    #[test]
    fn same_seed_same_workload() {
        let config = EngineConfig::default();
        let mut a = Workload::new(&config, 10, 42, 50);
        let mut b = Workload::new(&config, 10, 42, 50);
        for tag in 0..10 {
            assert_eq!(a.next(tag), b.next(tag));
        }
    }

    #[test]
    fn matched_reads_run_to_completion() {
        let mut config = EngineConfig {
            tokens: 16,
            ..EngineConfig::default()
        };
        config.pools.read_buffers = 4;
        let summary = run(config, 200);
        assert_eq!(summary.submitted, 200);
        assert_eq!(summary.finished, 200);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.counters.run_state, RunState::Dead);
        assert_eq!(summary.counters.free, 16);
        assert_eq!(summary.counters.read_awaiting_fill, 4);
    }

    #[test]
    fn direct_reads_run_to_completion() {
        let config = EngineConfig {
            tokens: 16,
            mce_free: false,
            ..EngineConfig::default()
        };
        let read_buffers = config.pools.read_buffers as usize;
        let summary = run(config, 200);
        assert_eq!(summary.finished, 200);
        assert_eq!(summary.counters.read_available, read_buffers);
        assert_eq!(summary.counters.matches, 0);
    }

    #[test]
    fn raised_stop_drains_without_new_work() {
        let config = EngineConfig::default();
        let mut workload = Workload::new(&config, 1_000, 3, 50);
        let mut engine = build_engine(config).unwrap();
        let summary = drive(&mut engine, &mut workload, &AtomicBool::new(true)).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.finished, 0);
    }
}
