//! Core data structures shared across the transfer, retry, and orchestration layers.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// What kind of payload the caller expects at a target URL.
///
/// Drives content validation: a `Binary` target that comes back as markup is
/// a blocking page, not a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedKind {
    Binary,
    Document,
}

/// A single resource to fetch, supplied by the caller and read-only to the core.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    pub url: Url,
    pub destination: PathBuf,
    pub expected_kind: ExpectedKind,
    /// Alternate URLs for the same logical resource, consulted in order once
    /// the primary URL's attempt budget is exhausted.
    pub alternates: Vec<Url>,
}

impl FetchTarget {
    pub fn new(url: Url, destination: impl Into<PathBuf>, expected_kind: ExpectedKind) -> Self {
        Self {
            url,
            destination: destination.into(),
            expected_kind,
            alternates: Vec::new(),
        }
    }

    pub fn with_alternates<I>(mut self, alternates: I) -> Self
    where
        I: IntoIterator<Item = Url>,
    {
        self.alternates = alternates.into_iter().collect();
        self
    }
}

/// Terminal state of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failed,
    Skipped,
}

/// Failure taxonomy surfaced to callers and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect, DNS, timeout, or truncated body.
    Transport,
    /// The response was a blocking or error page rather than genuine payload.
    ContentMismatch,
    /// Local I/O failure at the destination; never retried.
    Destination,
    /// Retry budget (including alternates) spent without a success.
    ExhaustedRetries,
    /// No eligible proxy and direct connections disallowed.
    PoolExhausted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport_error",
            ErrorKind::ContentMismatch => "content_mismatch",
            ErrorKind::Destination => "destination_error",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::PoolExhausted => "pool_exhausted",
        }
    }
}

/// Final report for one target. Produced exactly once, never mutated after.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub url: Url,
    pub destination: PathBuf,
    pub status: OutcomeStatus,
    pub bytes_transferred: u64,
    pub proxy_used: Option<String>,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

impl FetchOutcome {
    pub fn skipped(target: &FetchTarget) -> Self {
        Self {
            url: target.url.clone(),
            destination: target.destination.clone(),
            status: OutcomeStatus::Skipped,
            bytes_transferred: 0,
            proxy_used: None,
            attempts: 0,
            error_kind: None,
            elapsed: Duration::ZERO,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Error raised by a single transfer attempt.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("blocking or error page detected: {0}")]
    ContentMismatch(String),
    #[error("destination error: {0}")]
    Destination(#[from] std::io::Error),
    #[error("no eligible proxy and direct connections disabled")]
    PoolExhausted,
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Transport(_) | TransferError::Cancelled => ErrorKind::Transport,
            TransferError::ContentMismatch(_) => ErrorKind::ContentMismatch,
            TransferError::Destination(_) => ErrorKind::Destination,
            TransferError::PoolExhausted => ErrorKind::PoolExhausted,
        }
    }

    /// Whether a retry with a fresh egress could change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransferError::Destination(_) | TransferError::Cancelled
        )
    }
}

/// Cooperative stop flag checked between targets, retry attempts, and body
/// chunks. In-flight transfers abort promptly and keep their partial file so
/// a later run can resume it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
