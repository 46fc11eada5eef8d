use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use primitive_cost_bench::alloc::CountingAlloc;
use primitive_cost_bench::benches;
use primitive_cost_bench::error::HarnessError;
use primitive_cost_bench::harness::{BenchConfig, BenchTime, Profile};
use primitive_cost_bench::registry::{Case, Filter, Registry};
use primitive_cost_bench::report::{name_width, TextReporter};
use primitive_cost_bench::runner::{self, RunPlan};
use primitive_cost_bench::schema::{BenchReport, RunMeta, SCHEMA_VERSION};
use primitive_cost_bench::Suite;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc::system();

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProfileArg {
    Quick,
    Full,
}

impl From<ProfileArg> for Profile {
    fn from(v: ProfileArg) -> Self {
        match v {
            ProfileArg::Quick => Profile::Quick,
            ProfileArg::Full => Profile::Full,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(ClapArgs, Debug)]
struct Selection {
    /// Only cases whose `/`-separated name segments match this pattern.
    #[arg(long = "run", value_name = "PATTERN")]
    pattern: Option<String>,

    /// Treat `--run` as an exact full case name.
    #[arg(long, default_value_t = false)]
    exact: bool,

    /// Restrict the catalogue to one area.
    #[arg(long, value_enum, default_value_t = Suite::All)]
    suite: Suite,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate and measure the selected cases.
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Stabilization target: a duration (`1s`, `250ms`) or a fixed
        /// iteration count (`100x`). Defaults to the profile's target.
        #[arg(long, value_name = "TIME")]
        bench_time: Option<BenchTime>,

        /// Run each case this many times.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,

        /// Worker counts for parallel cases; each case runs once per value.
        #[arg(long, value_name = "N,...", value_delimiter = ',')]
        cpu: Vec<usize>,

        /// Report B/op and allocs/op.
        #[arg(long, default_value_t = false)]
        benchmem: bool,
    },

    /// Print the names of the selected cases without running them.
    List {
        #[command(flatten)]
        selection: Selection,
    },
}

#[derive(Parser, Debug)]
#[command(name = "primitive-cost-bench")]
#[command(about = "Micro-benchmarks for the cost of runtime primitives")]
struct Args {
    #[arg(long, value_enum, default_value_t = ProfileArg::Quick, global = true)]
    profile: ProfileArg,

    #[arg(long, default_value_t = 0, global = true)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = Format::Text, global = true)]
    format: Format,

    /// Where to write the report. If omitted, prints to stdout.
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Raise log verbosity (`-v` debug, `-vv` trace). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("primitive_cost_bench={level}")));
    // stdout carries the report.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn git_sha_short() -> Option<String> {
    // Best-effort: read from environment set by CI/build scripts.
    std::env::var("GIT_SHA")
        .ok()
        .or_else(|| std::env::var("GITHUB_SHA").ok())
        .map(|s| s.chars().take(12).collect())
}

fn open_output(out: Option<&Path>) -> Result<Box<dyn Write>, HarnessError> {
    Ok(match out {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    })
}

fn catalogue(selection: &Selection) -> Result<(Registry, Filter), HarnessError> {
    let mut reg = Registry::new();
    benches::register_suite(&mut reg, selection.suite)?;
    let filter = Filter::parse(selection.pattern.as_deref(), selection.exact)?;
    Ok((reg, filter))
}

fn list(args: &Args, selection: &Selection) -> Result<bool, HarnessError> {
    let (reg, filter) = catalogue(selection)?;
    let names: Vec<&str> = reg.select(&filter).into_iter().map(Case::name).collect();

    let mut out = open_output(args.out.as_deref())?;
    match args.format {
        Format::Text => {
            for name in &names {
                writeln!(out, "{name}")?;
            }
        }
        Format::Json => writeln!(out, "{}", serde_json::to_string_pretty(&names)?)?,
    }
    out.flush()?;
    Ok(true)
}

fn run(
    args: &Args,
    selection: &Selection,
    bench_time: Option<BenchTime>,
    plan: RunPlan,
    benchmem: bool,
) -> Result<bool, HarnessError> {
    let (reg, filter) = catalogue(selection)?;

    let mut cfg = BenchConfig::new(args.profile.into());
    cfg.seed = args.seed;
    if let Some(bench_time) = bench_time {
        cfg.bench_time = bench_time;
    }
    if benchmem {
        cfg.alloc = Some(&GLOBAL);
    }

    match args.format {
        Format::Text => {
            let cpus = if plan.cpus.is_empty() {
                vec![cfg.parallelism]
            } else {
                plan.cpus.clone()
            };
            let names: Vec<String> = reg
                .select(&filter)
                .iter()
                .flat_map(|c| cpus.iter().map(|&cpu| plan.display_name(c.name(), cpu)))
                .collect();
            let width = name_width(names.iter().map(String::as_str));

            let mut reporter = TextReporter::new(open_output(args.out.as_deref())?, width);
            let mut write_err = None;
            let summary = runner::run(&reg, &filter, &cfg, &plan, &mut |report| {
                if let Err(e) = reporter.case(report) {
                    write_err.get_or_insert(e);
                }
            });
            if let Some(e) = write_err {
                return Err(e.into());
            }
            reporter.trailer(&summary)?;
            Ok(summary.success())
        }
        Format::Json => {
            let summary = runner::run(&reg, &filter, &cfg, &plan, &mut |report| {
                tracing::info!(case = %report.name, status = ?report.outcome.status(), "done");
            });
            let report = BenchReport {
                run: RunMeta {
                    schema_version: SCHEMA_VERSION,
                    bench_version: env!("CARGO_PKG_VERSION").to_string(),
                    profile: cfg.profile.as_str().to_string(),
                    seed: cfg.seed,
                    bench_time: cfg.bench_time.to_string(),
                    timestamp_utc: chrono::Utc::now().to_rfc3339(),
                    git_sha: git_sha_short(),
                },
                measurements: summary.measurements(),
            };
            if let Some(out) = &args.out {
                report.write_to(out)?;
            } else {
                println!("{}", report.to_json()?);
            }
            Ok(summary.success())
        }
    }
}

fn execute(args: &Args) -> Result<bool, HarnessError> {
    match &args.cmd {
        Command::List { selection } => list(args, selection),
        Command::Run {
            selection,
            bench_time,
            count,
            cpu,
            benchmem,
        } => {
            let plan = RunPlan {
                count: *count,
                cpus: cpu.clone(),
            };
            run(args, selection, *bench_time, plan, *benchmem)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match execute(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
    }
}
