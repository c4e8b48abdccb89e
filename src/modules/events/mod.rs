//! Event hooks around the orchestration loop.
//!
//! Handlers observe transfers for logging, statistics, and custom reactions;
//! the dispatcher broadcasts every event to all registered handlers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::stats::StatsCollector;
use crate::engine::types::{ErrorKind, FetchOutcome};
use crate::modules::timing::PacingProfile;

/// Emitted just before a transfer attempt hits the network.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub proxy: Option<String>,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Emitted after a transfer attempt succeeds.
#[derive(Debug, Clone)]
pub struct TransferCompleteEvent {
    pub url: Url,
    pub bytes_transferred: u64,
    pub proxy: Option<String>,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when the retry coordinator schedules another attempt.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub attempt: u32,
    pub reason: ErrorKind,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a session is replaced.
#[derive(Debug, Clone)]
pub struct SessionRotatedEvent {
    pub downloads_served: u32,
    pub next_pattern: PacingProfile,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a target reaches a terminal failure.
#[derive(Debug, Clone)]
pub struct TargetFailedEvent {
    pub url: Url,
    pub error_kind: ErrorKind,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    PreRequest(PreRequestEvent),
    TransferComplete(TransferCompleteEvent),
    Retry(RetryEvent),
    SessionRotated(SessionRotatedEvent),
    TargetFailed(TargetFailedEvent),
    Outcome(FetchOutcome),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &FetchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: FetchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::PreRequest(pre) => {
                log::debug!(
                    "-> {} attempt {} via {}",
                    pre.url,
                    pre.attempt,
                    pre.proxy.as_deref().unwrap_or("direct")
                );
            }
            FetchEvent::TransferComplete(done) => {
                log::info!(
                    "completed {} ({} bytes via {} in {:.2}s)",
                    done.url,
                    done.bytes_transferred,
                    done.proxy.as_deref().unwrap_or("direct"),
                    done.elapsed.as_secs_f64()
                );
            }
            FetchEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} ({}) after {:.2}s",
                    retry.url,
                    retry.attempt,
                    retry.reason.as_str(),
                    retry.scheduled_after.as_secs_f64()
                );
            }
            FetchEvent::SessionRotated(rotated) => {
                log::info!(
                    "session rotated after {} downloads, next pattern {:?}",
                    rotated.downloads_served,
                    rotated.next_pattern
                );
            }
            FetchEvent::TargetFailed(failed) => {
                log::warn!(
                    "failed {} ({}) after {} attempts",
                    failed.url,
                    failed.error_kind.as_str(),
                    failed.attempts
                );
            }
            FetchEvent::Outcome(outcome) => {
                log::debug!(
                    "outcome {} -> {:?} ({} bytes)",
                    outcome.url,
                    outcome.status,
                    outcome.bytes_transferred
                );
            }
        }
    }
}

/// Feeds terminal outcomes into the statistics collector.
#[derive(Clone)]
pub struct StatsHandler {
    stats: StatsCollector,
}

impl StatsHandler {
    pub fn new(stats: StatsCollector) -> Self {
        Self { stats }
    }
}

impl EventHandler for StatsHandler {
    fn handle(&self, event: &FetchEvent) {
        if let FetchEvent::Outcome(outcome) = event {
            self.stats.record_outcome(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &FetchEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(FetchEvent::SessionRotated(SessionRotatedEvent {
            downloads_served: 17,
            next_pattern: PacingProfile::Normal,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }
}
