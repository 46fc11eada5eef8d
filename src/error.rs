/// Startup and configuration errors of the harness.
///
/// Per-case outcomes never use this type; a failing or skipped case is a
/// [`crate::harness::Stop`] and only affects that case.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("duplicate case name: {0}")]
    DuplicateCase(String),

    #[error("invalid case name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid bench time {0:?} (expected e.g. 1s, 250ms, 100x)")]
    InvalidBenchTime(String),

    #[error("invalid state transition for {case}: {from:?} -> {to:?}")]
    InvalidTransition {
        case: String,
        from: crate::runner::CaseState,
        to: crate::runner::CaseState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
