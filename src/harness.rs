use std::any::Any;
use std::fmt;
use std::hint::black_box;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::alloc::{AllocSnapshot, CountingAlloc};
use crate::error::HarnessError;

/// Upper bound on the iteration count of a single trial.
pub const DEFAULT_MAX_ITERS: u64 = 1_000_000_000;

const MAX_GRAIN: u64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Quick,
    Full,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Quick => "quick",
            Profile::Full => "full",
        }
    }

    pub fn default_bench_time(&self) -> BenchTime {
        match self {
            Profile::Quick => BenchTime::Duration(Duration::from_millis(100)),
            Profile::Full => BenchTime::Duration(Duration::from_secs(1)),
        }
    }
}

/// Stabilization target: either a minimum measured duration for the final
/// trial, or a fixed iteration count (`100x`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BenchTime {
    Duration(Duration),
    Iterations(u64),
}

impl FromStr for BenchTime {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HarnessError::InvalidBenchTime(s.to_string());
        let s = s.trim();

        if let Some(count) = s.strip_suffix('x') {
            let n: u64 = count.parse().map_err(|_| invalid())?;
            if n == 0 {
                return Err(invalid());
            }
            return Ok(BenchTime::Iterations(n));
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (value, unit) = s.split_at(split);
        let value: f64 = value.parse().map_err(|_| invalid())?;
        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            _ => return Err(invalid()),
        };
        let nanos = value * nanos_per_unit;
        if !nanos.is_finite() || nanos < 0.0 {
            return Err(invalid());
        }
        Ok(BenchTime::Duration(Duration::from_nanos(nanos as u64)))
    }
}

impl fmt::Display for BenchTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchTime::Duration(d) => write!(f, "{d:?}"),
            BenchTime::Iterations(n) => write!(f, "{n}x"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub profile: Profile,
    pub seed: u64,
    pub bench_time: BenchTime,
    pub max_iters: u64,
    /// Worker count for [`Bencher::run_parallel`].
    pub parallelism: usize,
    /// Installed global allocator, if allocation reporting is wanted.
    pub alloc: Option<&'static CountingAlloc>,
}

impl BenchConfig {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            seed: 0,
            bench_time: profile.default_bench_time(),
            max_iters: DEFAULT_MAX_ITERS,
            parallelism: default_parallelism(),
            alloc: None,
        }
    }

    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::new(Profile::Quick)
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Early end of a case: a failure or a deliberate skip.
///
/// Any `std::error::Error` converts into `Stop::Failed`, so case bodies can use
/// `?` on the operations they call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    Failed(String),
    Skipped(String),
}

impl Stop {
    pub fn fail(message: impl Into<String>) -> Self {
        Stop::Failed(message.into())
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Stop::Skipped(reason.into())
    }
}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stop::Failed(msg) => write!(f, "failed: {msg}"),
            Stop::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

impl<E: std::error::Error> From<E> for Stop {
    fn from(err: E) -> Self {
        Stop::Failed(err.to_string())
    }
}

pub type CaseResult = Result<(), Stop>;

/// Body of a case. Registered bodies are `CaseFn<'static>`; bodies timed
/// directly may borrow from the caller.
pub type CaseFn<'a> = dyn Fn(&mut Bencher) -> CaseResult + Send + Sync + 'a;

/// Worker pool shared by all trials of one case run.
#[derive(Debug, Default)]
pub(crate) struct WorkerPool {
    pool: OnceLock<rayon::ThreadPool>,
}

impl WorkerPool {
    fn get(&self, workers: usize) -> Result<&rayon::ThreadPool, Stop> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        let built = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("bench-worker-{i}"))
            .build()?;
        Ok(self.pool.get_or_init(move || built))
    }
}

/// Handle passed to a case body for one trial.
///
/// The timer is running when the body is entered. Work done before
/// [`reset_timer`](Bencher::reset_timer), or between
/// [`stop_timer`](Bencher::stop_timer) and [`start_timer`](Bencher::start_timer),
/// is not measured.
pub struct Bencher {
    n: u64,
    parallelism: usize,
    seed: u64,
    timer_on: bool,
    start: Instant,
    elapsed: Duration,
    alloc: Option<&'static CountingAlloc>,
    alloc_start: AllocSnapshot,
    alloc_total: AllocSnapshot,
    bytes: Option<u64>,
    sink: Option<Box<dyn Any + Send>>,
    pool: Arc<WorkerPool>,
}

impl Bencher {
    pub(crate) fn new(n: u64, cfg: &BenchConfig, pool: Arc<WorkerPool>) -> Self {
        Self {
            n,
            parallelism: cfg.parallelism.max(1),
            seed: cfg.seed,
            timer_on: false,
            start: Instant::now(),
            elapsed: Duration::ZERO,
            alloc: cfg.alloc,
            alloc_start: AllocSnapshot::default(),
            alloc_total: AllocSnapshot::default(),
            bytes: None,
            sink: None,
            pool,
        }
    }

    /// Iteration count the measured loop must run.
    pub fn iters(&self) -> u64 {
        self.n
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }

    /// Zeroes the measured time and allocation counters. The timer keeps its
    /// running/stopped state.
    pub fn reset_timer(&mut self) {
        if self.timer_on {
            self.start = Instant::now();
            self.alloc_start = self.alloc_snapshot();
        }
        self.elapsed = Duration::ZERO;
        self.alloc_total = AllocSnapshot::default();
    }

    pub fn start_timer(&mut self) {
        if !self.timer_on {
            self.alloc_start = self.alloc_snapshot();
            self.start = Instant::now();
            self.timer_on = true;
        }
    }

    pub fn stop_timer(&mut self) {
        if self.timer_on {
            self.elapsed += self.start.elapsed();
            let delta = self.alloc_snapshot().since(self.alloc_start);
            self.alloc_total.allocs += delta.allocs;
            self.alloc_total.bytes += delta.bytes;
            self.timer_on = false;
        }
    }

    /// Bytes processed by one iteration; enables MB/s reporting.
    pub fn set_bytes(&mut self, bytes: u64) {
        self.bytes = Some(bytes);
    }

    /// Escapes the final value of the measured loop.
    pub fn sink<T: Any + Send>(&mut self, value: T) {
        self.sink = Some(Box::new(black_box(value)));
    }

    /// Runs `body` on `parallelism()` workers that share this trial's
    /// iteration budget. Returns the number of iterations executed, which is
    /// exactly `iters()` once every worker has drained its iterator.
    pub fn run_parallel<F>(&mut self, body: F) -> Result<u64, Stop>
    where
        F: Fn(&mut ParallelIter<'_>) + Sync,
    {
        let workers = self.parallelism;
        let pool = self.pool.get(workers)?;

        let n = self.n;
        let grain = (n / (workers as u64 * 64)).clamp(1, MAX_GRAIN);
        let next = AtomicU64::new(0);

        let executed = pool.broadcast(|_| {
            let mut it = ParallelIter {
                next: &next,
                n,
                grain,
                cache: 0,
                executed: 0,
            };
            body(&mut it);
            it.executed
        });
        Ok(executed.iter().sum())
    }

    fn alloc_snapshot(&self) -> AllocSnapshot {
        self.alloc.map(|a| a.snapshot()).unwrap_or_default()
    }
}

/// Per-worker view of a shared iteration budget.
pub struct ParallelIter<'a> {
    next: &'a AtomicU64,
    n: u64,
    grain: u64,
    cache: u64,
    executed: u64,
}

impl ParallelIter<'_> {
    /// Claims the next iteration; `false` once the budget is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.cache == 0 {
            let start = self.next.fetch_add(self.grain, Ordering::Relaxed);
            if start >= self.n {
                return false;
            }
            self.cache = self.grain.min(self.n - start);
        }
        self.cache -= 1;
        self.executed += 1;
        true
    }

    pub fn sink<T>(&self, value: T) {
        black_box(value);
    }
}

/// Builds a case body from explicit setup, measured and teardown phases.
/// Setup and teardown run with the timer stopped; teardown runs even when the
/// measured phase fails.
pub fn phased<S, Setup, Measure, Teardown>(
    setup: Setup,
    measure: Measure,
    teardown: Teardown,
) -> impl Fn(&mut Bencher) -> CaseResult + Send + Sync
where
    Setup: Fn(&mut Bencher) -> Result<S, Stop> + Send + Sync,
    Measure: Fn(&mut Bencher, &mut S) -> CaseResult + Send + Sync,
    Teardown: Fn(S) + Send + Sync,
{
    move |b: &mut Bencher| {
        b.stop_timer();
        let mut state = setup(b)?;
        b.reset_timer();
        b.start_timer();
        let result = measure(b, &mut state);
        b.stop_timer();
        teardown(state);
        result
    }
}

/// Outcome of one trial.
#[derive(Debug)]
pub struct Trial {
    pub iters: u64,
    pub elapsed: Duration,
    pub allocs: Option<AllocSnapshot>,
    pub bytes: Option<u64>,
    pub sink: Option<Box<dyn Any + Send>>,
}

pub(crate) fn run_trial(
    body: &CaseFn<'_>,
    n: u64,
    cfg: &BenchConfig,
    pool: &Arc<WorkerPool>,
) -> Result<Trial, Stop> {
    let mut b = Bencher::new(n, cfg, Arc::clone(pool));
    b.start_timer();
    let result = body(&mut b);
    b.stop_timer();
    result?;

    Ok(Trial {
        iters: n,
        elapsed: b.elapsed,
        allocs: b.alloc.map(|_| b.alloc_total),
        bytes: b.bytes,
        sink: b.sink,
    })
}

/// Measured time of a single trial of `body` at exactly `n` iterations, with
/// no calibration. Lets an external driver choose the iteration counts.
pub fn time_iters(body: &CaseFn<'_>, n: u64, cfg: &BenchConfig) -> Result<Duration, Stop> {
    let pool = Arc::new(WorkerPool::default());
    Ok(run_trial(body, n, cfg, &pool)?.elapsed)
}

/// Phase of the calibration protocol, reported to the caller of
/// [`measure_case`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Calibrating,
    Measuring,
}

/// Final, authoritative measurement of a case.
#[derive(Debug)]
pub struct CaseRun {
    pub iters: u64,
    pub total: Duration,
    pub ns_per_iter: f64,
    pub bytes_per_op: Option<u64>,
    pub allocs_per_op: Option<u64>,
    pub bytes_processed: Option<u64>,
    /// Trials executed, calibration included.
    pub trials: u32,
    pub sink: Option<Box<dyn Any + Send>>,
}

impl CaseRun {
    fn from_trial(trial: Trial, trials: u32) -> Self {
        let iters = trial.iters.max(1);
        let total_ns = trial.elapsed.as_nanos();
        Self {
            iters: trial.iters,
            total: trial.elapsed,
            ns_per_iter: total_ns as f64 / iters as f64,
            bytes_per_op: trial.allocs.map(|a| a.bytes / iters),
            allocs_per_op: trial.allocs.map(|a| a.allocs / iters),
            bytes_processed: trial.bytes,
            trials,
            sink: trial.sink,
        }
    }

    pub fn mb_per_s(&self) -> Option<f64> {
        let bytes = self.bytes_processed?;
        let secs = self.total.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some((bytes as f64 * self.iters as f64) / 1e6 / secs)
    }
}

fn predict_iters(last: u64, elapsed: Duration, goal: Duration, max_iters: u64) -> u64 {
    let prev_ns = elapsed.as_nanos().max(1);
    let predicted = goal.as_nanos().saturating_mul(last as u128) / prev_ns;
    let mut n = u64::try_from(predicted).unwrap_or(u64::MAX);
    n = n.saturating_add(n / 5);
    n = n.min(last.saturating_mul(100));
    n = n.max(last.saturating_add(1));
    n.min(max_iters)
}

/// Calibrates and measures one case.
///
/// The first trial runs a single iteration. With a duration target the
/// iteration count is then scaled from the observed per-iteration cost until
/// a trial's measured time reaches the target or `max_iters` is hit; with a
/// fixed count one trial runs at exactly that count. Only the last trial is
/// reported.
pub fn measure_case(
    body: &CaseFn<'_>,
    cfg: &BenchConfig,
    on_phase: &mut dyn FnMut(Phase),
) -> Result<CaseRun, Stop> {
    let pool = Arc::new(WorkerPool::default());
    let max_iters = cfg.max_iters.max(1);

    on_phase(Phase::Calibrating);
    let mut trial = run_trial(body, 1, cfg, &pool)?;
    let mut trials = 1;

    match cfg.bench_time {
        BenchTime::Iterations(n) => {
            if n > 1 {
                on_phase(Phase::Measuring);
                trial = run_trial(body, n, cfg, &pool)?;
                trials += 1;
            }
        }
        BenchTime::Duration(goal) => {
            let mut measuring = false;
            while trial.elapsed < goal && trial.iters < max_iters {
                let n = predict_iters(trial.iters, trial.elapsed, goal, max_iters);
                if !measuring {
                    on_phase(Phase::Measuring);
                    measuring = true;
                }
                tracing::trace!(iters = n, "trial");
                trial = run_trial(body, n, cfg, &pool)?;
                trials += 1;
            }
        }
    }

    Ok(CaseRun::from_trial(trial, trials))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn quick_cfg(bench_time: BenchTime) -> BenchConfig {
        BenchConfig {
            bench_time,
            max_iters: 10_000_000,
            ..BenchConfig::default()
        }
    }

    fn no_phase() -> impl FnMut(Phase) {
        |_| {}
    }

    #[test]
    fn parses_bench_time() {
        assert_eq!(
            "1s".parse::<BenchTime>().unwrap(),
            BenchTime::Duration(Duration::from_secs(1))
        );
        assert_eq!(
            "250ms".parse::<BenchTime>().unwrap(),
            BenchTime::Duration(Duration::from_millis(250))
        );
        assert_eq!(
            "1.5s".parse::<BenchTime>().unwrap(),
            BenchTime::Duration(Duration::from_millis(1500))
        );
        assert_eq!(
            "100x".parse::<BenchTime>().unwrap(),
            BenchTime::Iterations(100)
        );
        assert!("0x".parse::<BenchTime>().is_err());
        assert!("fast".parse::<BenchTime>().is_err());
        assert!("10".parse::<BenchTime>().is_err());
        assert!("10h".parse::<BenchTime>().is_err());
    }

    #[test]
    fn fixed_iterations_run_exactly() {
        let cfg = quick_cfg(BenchTime::Iterations(37));
        let body = |b: &mut Bencher| -> CaseResult {
            let mut count = 0u64;
            for _ in 0..b.iters() {
                count += 1;
            }
            b.sink(count);
            Ok(())
        };
        let run = measure_case(&body, &cfg, &mut no_phase()).unwrap();
        assert_eq!(run.iters, 37);
        assert_eq!(run.trials, 2);
        let sunk = run.sink.unwrap().downcast::<u64>().unwrap();
        assert_eq!(*sunk, 37);
    }

    #[test]
    fn calibration_scales_until_goal() {
        let cfg = quick_cfg(BenchTime::Duration(Duration::from_millis(5)));
        let mut phases = Vec::new();
        let body = |b: &mut Bencher| -> CaseResult {
            let mut acc = 0u64;
            for i in 0..b.iters() {
                acc = black_box(acc.wrapping_add(i));
            }
            b.sink(acc);
            Ok(())
        };
        let run = measure_case(&body, &cfg, &mut |p| phases.push(p)).unwrap();

        assert!(run.iters > 1);
        assert!(run.trials > 1);
        assert!(run.total >= Duration::from_millis(5) || run.iters == cfg.max_iters);
        let expected = run.total.as_nanos() as f64 / run.iters as f64;
        assert!((run.ns_per_iter - expected).abs() < 1e-6);
        assert_eq!(phases, vec![Phase::Calibrating, Phase::Measuring]);
    }

    #[test]
    fn max_iters_caps_growth() {
        let cfg = BenchConfig {
            bench_time: BenchTime::Duration(Duration::from_secs(60)),
            max_iters: 500,
            ..BenchConfig::default()
        };
        let body = |b: &mut Bencher| -> CaseResult {
            for i in 0..b.iters() {
                black_box(i);
            }
            Ok(())
        };
        let run = measure_case(&body, &cfg, &mut no_phase()).unwrap();
        assert_eq!(run.iters, 500);
    }

    #[test]
    fn reset_timer_excludes_setup() {
        let cfg = quick_cfg(BenchTime::Duration(Duration::from_millis(1)));
        let body = |b: &mut Bencher| -> CaseResult {
            std::thread::sleep(Duration::from_millis(30));
            b.reset_timer();
            for i in 0..b.iters() {
                black_box(i);
            }
            Ok(())
        };
        let run = measure_case(&body, &cfg, &mut no_phase()).unwrap();
        // 30ms of setup amortized over the trial would dominate otherwise.
        assert!(run.ns_per_iter < 100_000.0, "ns/op = {}", run.ns_per_iter);
    }

    #[test]
    fn stop_and_start_timer_pause_measurement() {
        let cfg = quick_cfg(BenchTime::Iterations(3));
        let body = |b: &mut Bencher| -> CaseResult {
            for _ in 0..b.iters() {
                b.stop_timer();
                std::thread::sleep(Duration::from_millis(20));
                b.start_timer();
            }
            Ok(())
        };
        let run = measure_case(&body, &cfg, &mut no_phase()).unwrap();
        assert!(run.total < Duration::from_millis(20), "total = {:?}", run.total);
    }

    #[test]
    fn stop_propagates_from_body() {
        let cfg = quick_cfg(BenchTime::Iterations(10));
        let failing = |_: &mut Bencher| -> CaseResult {
            let n: i64 = "not a number".parse()?;
            black_box(n);
            Ok(())
        };
        let skipping = |_: &mut Bencher| -> CaseResult { Err(Stop::skip("leaks timers")) };

        match measure_case(&failing, &cfg, &mut no_phase()) {
            Err(Stop::Failed(msg)) => assert!(msg.contains("invalid digit")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        match measure_case(&skipping, &cfg, &mut no_phase()) {
            Err(Stop::Skipped(reason)) => assert_eq!(reason, "leaks timers"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn parallel_budget_is_executed_exactly_once() {
        for workers in [1usize, 3, 8] {
            let cfg = BenchConfig {
                bench_time: BenchTime::Iterations(10_007),
                parallelism: workers,
                ..BenchConfig::default()
            };
            let counted = AtomicU64::new(0);
            let reported = AtomicU64::new(0);
            let body = |b: &mut Bencher| -> CaseResult {
                counted.store(0, Ordering::Relaxed);
                let executed = b.run_parallel(|it| {
                    while it.next() {
                        counted.fetch_add(1, Ordering::Relaxed);
                    }
                })?;
                reported.store(executed, Ordering::Relaxed);
                Ok(())
            };
            let run = measure_case(&body, &cfg, &mut no_phase()).unwrap();
            assert_eq!(run.iters, 10_007);
            assert_eq!(counted.load(Ordering::Relaxed), 10_007);
            assert_eq!(reported.load(Ordering::Relaxed), 10_007);
        }
    }

    #[test]
    fn phased_runs_teardown_after_failure() {
        let cfg = quick_cfg(BenchTime::Iterations(2));
        let torn_down = AtomicBool::new(false);
        let body = phased(
            |_| Ok(vec![1u8, 2, 3]),
            |_, state: &mut Vec<u8>| {
                state.clear();
                Err(Stop::fail("boom"))
            },
            |state: Vec<u8>| {
                assert!(state.is_empty());
                torn_down.store(true, Ordering::Relaxed);
            },
        );
        let out = measure_case(&body, &cfg, &mut no_phase());
        assert_eq!(out.unwrap_err(), Stop::fail("boom"));
        assert!(torn_down.load(Ordering::Relaxed));
    }

    #[test]
    fn time_iters_runs_one_uncalibrated_trial() {
        let cfg = BenchConfig::default();
        let body = |b: &mut Bencher| -> CaseResult {
            b.stop_timer();
            std::thread::sleep(Duration::from_millis(10));
            b.start_timer();
            if b.iters() != 4 {
                return Err(Stop::fail(format!("ran {} iterations", b.iters())));
            }
            Ok(())
        };
        let elapsed = time_iters(&body, 4, &cfg).unwrap();
        assert!(elapsed < Duration::from_millis(10), "elapsed = {elapsed:?}");
    }

    #[test]
    fn throughput_uses_bytes_per_iteration() {
        let run = CaseRun::from_trial(
            Trial {
                iters: 1_000,
                elapsed: Duration::from_millis(1),
                allocs: None,
                bytes: Some(1_000),
                sink: None,
            },
            1,
        );
        // 1e6 bytes in 1ms.
        let mbs = run.mb_per_s().unwrap();
        assert!((mbs - 1_000.0).abs() < 1e-6);
    }
}
