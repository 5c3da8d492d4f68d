//! Task-level error taxonomy.
//!
//! Per-task errors never abort a job; they are recorded on the task row and
//! rolled up into the job counters.

use thiserror::Error;

/// Backend-specific parse failures. The orchestrator matches on the variant
/// to decide which fallback chain to run before surfacing the error.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("DealerOn parse error: {0}")]
    DealerOn(String),
    #[error("SmartPath parse error: {0}")]
    SmartPath(String),
    #[error("Team Velocity parse error: {0}")]
    TeamVelocity(String),
}

/// Errors surfaced at the scrape-task level.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Missing placeholder {{{0}}} in inventory URL template")]
    MissingPlaceholder(String),

    /// Transport errors and retryable HTTP statuses (429, 5xx). Retried up
    /// to the attempt budget, then escalated.
    #[error("retryable fetch error: {0}")]
    FetchRetryable(String),

    /// Non-retryable HTTP errors and malformed service responses.
    #[error("fetch failed: {0}")]
    FetchTerminal(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no parser for backend {0}")]
    UnknownBackend(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("job cancelled")]
    Cancelled,
}

impl ScrapeError {
    /// Whether another fetch attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScrapeError::FetchRetryable(_))
    }
}
