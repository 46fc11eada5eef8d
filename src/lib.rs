use clap::ValueEnum;

pub mod alloc;
pub mod benches;
pub mod error;
pub mod harness;
pub mod registry;
pub mod report;
pub mod runner;
pub mod schema;

/// Area of the case catalogue to register.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum Suite {
    /// Every built-in case.
    #[default]
    All,
    /// Stack vs heap, collection growth, strings, boxing into `dyn Any`.
    Allocation,
    /// Threads, tasks, channels, locks, atomics, wait groups, pools.
    Concurrency,
    /// Context creation, values, cancellation and deadlines.
    Context,
    /// Number/string conversion and formatting.
    Conversion,
    /// Array, vec and map access, copy and iteration.
    DataStructure,
    /// JSON, bincode, base64, hex, sha256.
    Encoding,
    /// Call overhead: arguments, receivers, dyn dispatch, closures.
    FunctionCall,
    /// Downcasts, dispatch, panics, reflection, regex, errors, sorting.
    Misc,
    /// Clocks, time zones, formatting, timers and tickers.
    Time,
}
