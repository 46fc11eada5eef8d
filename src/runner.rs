//! Batch execution of selected cases.
//!
//! Cases run one after another on the calling thread. Each case run is
//! isolated with `catch_unwind`, so a panicking case is reported as failed and
//! the batch continues.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::error::HarnessError;
use crate::harness::{self, BenchConfig, CaseRun, Phase, Stop};
use crate::registry::{Case, Filter, Registry};
use crate::schema::{CaseStatus, Measurement};

/// Lifecycle of one case run.
///
/// `Registered → Calibrating → Measuring → {Reported | Failed | Skipped}`.
/// A case may also finish straight from `Calibrating` (fixed single-iteration
/// runs, or a failure in the first trial). Terminal states are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseState {
    Registered,
    Calibrating,
    Measuring,
    Reported,
    Failed,
    Skipped,
}

impl CaseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaseState::Reported | CaseState::Failed | CaseState::Skipped
        )
    }

    pub fn transition(self, next: CaseState, case: &str) -> Result<CaseState, HarnessError> {
        use CaseState::*;
        let allowed = match (self, next) {
            (Registered, Calibrating) => true,
            (Registered, Failed | Skipped) => true,
            (Calibrating, Measuring) => true,
            (Calibrating | Measuring, Reported | Failed | Skipped) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(HarnessError::InvalidTransition {
                case: case.to_string(),
                from: self,
                to: next,
            })
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Reported(CaseRun),
    Failed(String),
    Skipped(String),
}

impl Outcome {
    fn state(&self) -> CaseState {
        match self {
            Outcome::Reported(_) => CaseState::Reported,
            Outcome::Failed(_) => CaseState::Failed,
            Outcome::Skipped(_) => CaseState::Skipped,
        }
    }

    pub fn status(&self) -> CaseStatus {
        match self {
            Outcome::Reported(_) => CaseStatus::Reported,
            Outcome::Failed(_) => CaseStatus::Failed,
            Outcome::Skipped(_) => CaseStatus::Skipped,
        }
    }
}

/// Repetition plan: every selected case runs once per `cpus` entry, `count`
/// times each.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub count: u32,
    pub cpus: Vec<usize>,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            count: 1,
            cpus: Vec::new(),
        }
    }
}

impl RunPlan {
    fn cpus(&self, cfg: &BenchConfig) -> Vec<usize> {
        if self.cpus.is_empty() {
            vec![cfg.parallelism.max(1)]
        } else {
            self.cpus.iter().map(|&c| c.max(1)).collect()
        }
    }

    /// Reported name of `case` when run with `cpu` workers.
    pub fn display_name(&self, case: &str, cpu: usize) -> String {
        if self.cpus.len() > 1 {
            format!("{case}-{cpu}")
        } else {
            case.to_string()
        }
    }
}

#[derive(Debug)]
pub struct CaseReport {
    pub name: String,
    pub case: String,
    pub cpu: usize,
    pub run_index: u32,
    pub state: CaseState,
    pub outcome: Outcome,
}

impl CaseReport {
    pub fn to_measurement(&self) -> Measurement {
        let (message, run) = match &self.outcome {
            Outcome::Reported(run) => (None, Some(run)),
            Outcome::Failed(msg) | Outcome::Skipped(msg) => (Some(msg.clone()), None),
        };
        let throughput = run.and_then(|r| r.mb_per_s()).map(|mb| mb * 1e6);

        Measurement {
            name: self.name.clone(),
            status: self.outcome.status(),
            message,
            unit: "ns/iter".to_string(),
            iters: run.map_or(0, |r| r.iters),
            total_ns: run.map_or(0, |r| r.total.as_nanos()),
            ns_per_iter: run.map_or(0.0, |r| r.ns_per_iter),
            bytes_per_op: run.and_then(|r| r.bytes_per_op),
            allocs_per_op: run.and_then(|r| r.allocs_per_op),
            bytes_processed: run.and_then(|r| r.bytes_processed),
            throughput_bytes_per_s: throughput,
            extra: json!({
                "case": self.case,
                "cpu": self.cpu,
                "run": self.run_index,
                "trials": run.map(|r| r.trials),
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<CaseReport>,
    pub wall: Duration,
}

impl RunSummary {
    fn count(&self, status: CaseStatus) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.status() == status)
            .count()
    }

    pub fn reported(&self) -> usize {
        self.count(CaseStatus::Reported)
    }

    pub fn failed(&self) -> usize {
        self.count(CaseStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(CaseStatus::Skipped)
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    /// Sum of the final-trial measured time over reported cases only.
    pub fn measured_total(&self) -> Duration {
        self.reports
            .iter()
            .filter_map(|r| match &r.outcome {
                Outcome::Reported(run) => Some(run.total),
                _ => None,
            })
            .sum()
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.reports.iter().map(CaseReport::to_measurement).collect()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn advance(state: &mut CaseState, next: CaseState, name: &str) {
    match state.transition(next, name) {
        Ok(s) => {
            tracing::debug!(case = name, from = ?*state, to = ?s, "case state");
            *state = s;
        }
        Err(e) => tracing::error!("{e}"),
    }
}

/// Runs one case once, with `cpu` workers available to parallel bodies.
pub fn run_case(
    case: &Case,
    name: String,
    cfg: &BenchConfig,
    cpu: usize,
    run_index: u32,
) -> CaseReport {
    let cfg = BenchConfig {
        parallelism: cpu,
        ..cfg.clone()
    };
    let mut state = CaseState::Registered;

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        harness::measure_case(case.body(), &cfg, &mut |phase| {
            let next = match phase {
                Phase::Calibrating => CaseState::Calibrating,
                Phase::Measuring => CaseState::Measuring,
            };
            advance(&mut state, next, &name);
        })
    }));

    let outcome = match result {
        Ok(Ok(run)) => Outcome::Reported(run),
        Ok(Err(Stop::Failed(msg))) => {
            tracing::warn!(case = %name, "case failed: {msg}");
            Outcome::Failed(msg)
        }
        Ok(Err(Stop::Skipped(reason))) => {
            tracing::debug!(case = %name, "case skipped: {reason}");
            Outcome::Skipped(reason)
        }
        Err(payload) => {
            let msg = format!("panicked: {}", panic_message(payload.as_ref()));
            tracing::warn!(case = %name, "{msg}");
            Outcome::Failed(msg)
        }
    };
    advance(&mut state, outcome.state(), &name);

    CaseReport {
        name,
        case: case.name().to_string(),
        cpu,
        run_index,
        state,
        outcome,
    }
}

/// Runs every case selected by `filter` according to `plan`, calling
/// `on_result` after each case run.
pub fn run(
    registry: &Registry,
    filter: &Filter,
    cfg: &BenchConfig,
    plan: &RunPlan,
    on_result: &mut dyn FnMut(&CaseReport),
) -> RunSummary {
    let started = Instant::now();
    let selected = registry.select(filter);
    let cpus = plan.cpus(cfg);
    tracing::info!(
        cases = selected.len(),
        bench_time = %cfg.bench_time,
        count = plan.count,
        "running benchmarks"
    );

    let mut reports = Vec::new();
    for case in selected {
        for &cpu in &cpus {
            for run_index in 0..plan.count {
                let name = plan.display_name(case.name(), cpu);
                let report = run_case(case, name, cfg, cpu, run_index);
                on_result(&report);
                reports.push(report);
            }
        }
    }

    RunSummary {
        reports,
        wall: started.elapsed(),
    }
}
