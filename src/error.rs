//! Error types for the serp-retriever crate.

use std::time::Duration;

use thiserror::Error;

use crate::detector::FetchOutcome;

/// Errors surfaced by the searcher.
///
/// `RateLimited` and `CircuitOpen` are returned immediately so callers can
/// reschedule instead of spinning; the remaining variants are produced only
/// after the internal retry policy is exhausted.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The destination is over its hard request ceiling.
    #[error("destination {destination} is over its hard request ceiling, retry after {retry_after:?}")]
    RateLimited {
        destination: String,
        retry_after: Duration,
    },

    /// The destination's circuit breaker is open.
    #[error("circuit open for {destination}, retry after {retry_after:?}")]
    CircuitOpen {
        destination: String,
        retry_after: Duration,
    },

    /// No identity became available within the bounded lease wait.
    #[error("no identity available in pool")]
    NoIdentityAvailable,

    /// Every attempt failed; the last outcome is kept for diagnostics.
    #[error("retrieval from {destination} failed after {attempts} attempts, last outcome: {last}")]
    RetrievalFailed {
        destination: String,
        attempts: u32,
        last: FetchOutcome,
    },

    /// A transport-level failure persisted through every retry.
    #[error("transport failure on {destination} persisted through {attempts} attempts, last outcome: {last}")]
    Transport {
        destination: String,
        attempts: u32,
        last: FetchOutcome,
    },

    /// The caller's deadline was reached before retrieval completed.
    #[error("deadline exceeded before retrieval completed")]
    DeadlineExceeded,
}
