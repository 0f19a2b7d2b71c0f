//! Error taxonomy for the pipeline.
//!
//! Per-record and per-source failures are values that end up in the run report.
//! Only [`PipelineError`] is allowed to abort a run.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failure raised by a source connector. Both variants are recoverable at the
/// orchestrator level.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Auth missing or rejected, network failure, or a non-2xx response.
    /// `transient` marks failures worth retrying (timeouts, 5xx).
    #[error("source unavailable: {cause}")]
    Unavailable { cause: String, transient: bool },

    /// Quota exhausted, either locally (token bucket) or upstream (HTTP 429).
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl SourceError {
    pub fn unavailable(cause: impl Into<String>) -> Self {
        Self::Unavailable {
            cause: cause.into(),
            transient: false,
        }
    }

    pub fn transient(cause: impl Into<String>) -> Self {
        Self::Unavailable {
            cause: cause.into(),
            transient: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { transient, .. } => *transient,
            Self::RateLimited { .. } => true,
        }
    }

    /// Short machine-readable label used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "source_unavailable",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Reason a raw record was routed to the rejected set.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("missing_identity")]
    MissingIdentity,
    #[error("missing_field")]
    MissingField,
    #[error("unparseable_timestamp")]
    UnparseableTimestamp,
    #[error("future_timestamp")]
    FutureTimestamp,
    #[error("invalid_numeric")]
    InvalidNumeric,
    #[error("out_of_bounds")]
    OutOfBounds,
    #[error("event_outside_match_window")]
    EventOutsideMatchWindow,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingIdentity => "missing_identity",
            Self::MissingField => "missing_field",
            Self::UnparseableTimestamp => "unparseable_timestamp",
            Self::FutureTimestamp => "future_timestamp",
            Self::InvalidNumeric => "invalid_numeric",
            Self::OutOfBounds => "out_of_bounds",
            Self::EventOutsideMatchWindow => "event_outside_match_window",
        }
    }
}

/// Warehouse write/read failure, classified so the loader can tell per-row
/// conflicts from structural defects.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Constraint violation on a single row (unique, foreign key, check).
    #[error("load conflict: {0}")]
    Conflict(String),

    /// Missing table/column or type mismatch: the schema contract is broken.
    #[error("schema violation: {0}")]
    Schema(String),

    /// Connection or driver failure.
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecastError {
    #[error("insufficient history: have {have} points, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    /// Every observation falls on the same day, so no trend can be fitted.
    #[error("degenerate history: {points} points on a single day")]
    DegenerateHistory { points: usize },
}

/// Run-level fault. Anything else is captured in the report.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_and_transient_errors_are_retryable() {
        assert!(SourceError::RateLimited { retry_after: None }.is_retryable());
        assert!(SourceError::transient("timeout").is_retryable());
        assert!(!SourceError::unavailable("missing key").is_retryable());
    }

    #[test]
    fn reject_reason_codes_match_display() {
        for reason in [
            RejectReason::MissingIdentity,
            RejectReason::FutureTimestamp,
            RejectReason::EventOutsideMatchWindow,
        ] {
            assert_eq!(reason.to_string(), reason.code());
        }
    }

    #[test]
    fn insufficient_history_message_names_counts() {
        let err = ForecastError::InsufficientHistory { have: 2, need: 7 };
        assert!(err.to_string().contains("have 2"));
        assert!(err.to_string().contains("need 7"));
    }
}
