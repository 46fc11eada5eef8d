//! Built-in case catalogue, one module per area.

use crate::error::HarnessError;
use crate::registry::Registry;
use crate::Suite;


/// Registers the cases of `suite` (every area for [`Suite::All`]).
pub fn register_suite(reg: &mut Registry, suite: Suite) -> Result<(), HarnessError> {
    match suite {
        Suite::All => register_all(reg),
        Suite::Allocation => allocation::register(reg),
        Suite::Concurrency => concurrency::register(reg),
        Suite::Context => context::register(reg),
        Suite::Conversion => conversion::register(reg),
        Suite::DataStructure => data_structure::register(reg),
        Suite::Encoding => encoding::register(reg),
        Suite::FunctionCall => function_call::register(reg),
        Suite::Misc => misc::register(reg),
        Suite::Time => time::register(reg),
    }
}

pub fn register_all(reg: &mut Registry) -> Result<(), HarnessError> {
    allocation::register(reg)?;
    concurrency::register(reg)?;
    context::register(reg)?;
    conversion::register(reg)?;
    data_structure::register(reg)?;
    encoding::register(reg)?;
    function_call::register(reg)?;
    misc::register(reg)?;
    time::register(reg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{BenchConfig, BenchTime};
    use crate::registry::Filter;
    use crate::runner::{self, CaseState, Outcome, RunPlan};
    use clap::ValueEnum;

    fn catalogue() -> Registry {
        let mut reg = Registry::new();
        register_all(&mut reg).unwrap();
        reg
    }

    #[test]
    fn suites_partition_the_catalogue() {
        let all = catalogue();
        let mut total = 0;
        for suite in Suite::value_variants() {
            if *suite == Suite::All {
                continue;
            }
            let mut reg = Registry::new();
            register_suite(&mut reg, *suite).unwrap();
            assert!(!reg.is_empty(), "{suite:?} registers nothing");
            total += reg.len();
        }
        assert_eq!(total, all.len());
    }

    #[test]
    fn registering_twice_collides() {
        let mut reg = catalogue();
        let err = time::register(&mut reg).unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateCase(_)));
    }

    #[test]
    fn every_case_completes_at_a_small_count() {
        let reg = catalogue();
        let cfg = BenchConfig {
            bench_time: BenchTime::Iterations(3),
            parallelism: 2,
            ..BenchConfig::default()
        };
        let summary = runner::run(&reg, &Filter::All, &cfg, &RunPlan::default(), &mut |_| {});
        assert_eq!(summary.reports.len(), reg.len());

        let mut skipped = Vec::new();
        for report in &summary.reports {
            match &report.outcome {
                Outcome::Reported(run) => assert_eq!(run.iters, 3, "{}", report.name),
                Outcome::Skipped(_) => skipped.push(report.name.as_str()),
                Outcome::Failed(msg) => panic!("{} failed: {msg}", report.name),
            }
            assert!(report.state.is_terminal());
            assert_ne!(report.state, CaseState::Failed);
        }
        assert_eq!(skipped, vec!["Timer/After", "Ticker/Tick"]);
    }
}
