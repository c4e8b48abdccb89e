//! Run statistics aggregation.
//!
//! A clone-shared collector that accumulates per-outcome counters and renders
//! the final run summary.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::types::{ErrorKind, FetchOutcome, OutcomeStatus};

/// Final tally for one orchestration run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_bytes: u64,
    pub duration: Duration,
    /// Outcomes in completion order, one per target.
    pub outcomes: Vec<FetchOutcome>,
}

impl RunSummary {
    pub fn total_targets(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }
}

/// Point-in-time view of the accumulated counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_bytes: u64,
    pub proxy_requests: u64,
    pub direct_requests: u64,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
}

#[derive(Debug)]
struct StatsInner {
    started_at: DateTime<Utc>,
    completed: u64,
    failed: u64,
    skipped: u64,
    total_bytes: u64,
    proxy_requests: u64,
    direct_requests: u64,
    errors_by_kind: HashMap<ErrorKind, u64>,
    outcomes: Vec<FetchOutcome>,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            completed: 0,
            failed: 0,
            skipped: 0,
            total_bytes: 0,
            proxy_requests: 0,
            direct_requests: 0,
            errors_by_kind: HashMap::new(),
            outcomes: Vec::new(),
        }
    }
}

/// Shared outcome accumulator. Cheap to clone; all clones feed one tally.
#[derive(Clone)]
pub struct StatsCollector {
    inner: Arc<Mutex<StatsInner>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsInner::new())),
        }
    }

    pub fn record_outcome(&self, outcome: &FetchOutcome) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        match outcome.status {
            OutcomeStatus::Success => inner.completed += 1,
            OutcomeStatus::Failed => inner.failed += 1,
            OutcomeStatus::Skipped => inner.skipped += 1,
        }
        inner.total_bytes += outcome.bytes_transferred;
        if outcome.status != OutcomeStatus::Skipped {
            match outcome.proxy_used {
                Some(_) => inner.proxy_requests += 1,
                None => inner.direct_requests += 1,
            }
        }
        if let Some(kind) = outcome.error_kind {
            *inner.errors_by_kind.entry(kind).or_insert(0) += 1;
        }
        inner.outcomes.push(outcome.clone());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().expect("stats lock poisoned");
        StatsSnapshot {
            started_at: inner.started_at,
            completed: inner.completed,
            failed: inner.failed,
            skipped: inner.skipped,
            total_bytes: inner.total_bytes,
            proxy_requests: inner.proxy_requests,
            direct_requests: inner.direct_requests,
            errors_by_kind: inner.errors_by_kind.clone(),
        }
    }

    /// Consume the accumulated outcomes into the final summary.
    pub fn into_summary(self, duration: Duration) -> RunSummary {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().expect("stats lock poisoned"),
            Err(shared) => {
                let guard = shared.lock().expect("stats lock poisoned");
                return RunSummary {
                    completed: guard.completed,
                    failed: guard.failed,
                    skipped: guard.skipped,
                    total_bytes: guard.total_bytes,
                    duration,
                    outcomes: guard.outcomes.clone(),
                };
            }
        };
        RunSummary {
            completed: inner.completed,
            failed: inner.failed,
            skipped: inner.skipped,
            total_bytes: inner.total_bytes,
            duration,
            outcomes: inner.outcomes,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn outcome(status: OutcomeStatus, bytes: u64, kind: Option<ErrorKind>) -> FetchOutcome {
        FetchOutcome {
            url: Url::parse("https://example.com/a.zip").unwrap(),
            destination: "a.zip".into(),
            status,
            bytes_transferred: bytes,
            proxy_used: None,
            attempts: 1,
            error_kind: kind,
            elapsed: Duration::from_secs(1),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn tallies_outcomes_by_status() {
        let stats = StatsCollector::new();
        stats.record_outcome(&outcome(OutcomeStatus::Success, 1024, None));
        stats.record_outcome(&outcome(
            OutcomeStatus::Failed,
            0,
            Some(ErrorKind::ExhaustedRetries),
        ));
        stats.record_outcome(&outcome(OutcomeStatus::Skipped, 0, None));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.total_bytes, 1024);
        assert_eq!(
            snapshot.errors_by_kind.get(&ErrorKind::ExhaustedRetries),
            Some(&1)
        );

        let summary = stats.into_summary(Duration::from_secs(3));
        assert_eq!(summary.total_targets(), 3);
        assert_eq!(summary.outcomes.len(), 3);
    }
}
