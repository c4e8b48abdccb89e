//! Bounded retries around the transfer engine.
//!
//! Classifies each attempt's failure, backs off with jitter, draws a fresh
//! proxy for the next attempt, and falls through to alternate source URLs
//! once the primary URL's budget is spent.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

use super::session::Session;
use super::transfer::TransferEngine;
use super::types::{ErrorKind, FetchOutcome, FetchTarget, OutcomeStatus, StopSignal, TransferError};
use crate::modules::events::{
    EventDispatcher, FetchEvent, PreRequestEvent, RetryEvent, TargetFailedEvent,
    TransferCompleteEvent,
};
use crate::modules::proxy::ProxyPool;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts against the primary URL; alternates add one attempt each.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Uniform jitter added on top of the exponential delay.
    pub backoff_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: Duration::from_millis(1500),
        }
    }
}

/// Exponential backoff before jitter: `base * 2^(attempt - 1)`, capped.
/// Monotone in the attempt number, so successive waits never shrink.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    config
        .backoff_base
        .saturating_mul(1u32 << exponent)
        .min(config.backoff_cap)
}

/// Drives one target through the transfer engine until success or exhaustion.
pub struct RetryCoordinator {
    engine: TransferEngine,
    pool: Arc<Mutex<ProxyPool>>,
    dispatcher: Arc<EventDispatcher>,
    config: RetryConfig,
}

impl RetryCoordinator {
    pub fn new(
        engine: TransferEngine,
        pool: Arc<Mutex<ProxyPool>>,
        dispatcher: Arc<EventDispatcher>,
        config: RetryConfig,
    ) -> Self {
        Self {
            engine,
            pool,
            dispatcher,
            config,
        }
    }

    /// Fetch one target, retrying transient failures with backoff and a fresh
    /// proxy, then trying each alternate URL once. Always returns an outcome;
    /// a single target's failure never propagates as an error.
    pub async fn fetch_with_retry(
        &self,
        target: &FetchTarget,
        session: &mut Session,
        stop: &StopSignal,
    ) -> FetchOutcome {
        let started = Instant::now();
        let plan = self.attempt_plan(target);
        let budget = plan.len() as u32;

        let mut attempts = 0u32;
        let mut last_error: Option<TransferError> = None;
        let mut last_proxy: Option<String> = None;

        for url in &plan {
            if stop.is_stopped() {
                break;
            }
            attempts += 1;

            self.dispatcher.dispatch(FetchEvent::PreRequest(PreRequestEvent {
                url: url.clone(),
                proxy: session.bound_proxy.as_ref().map(|c| c.endpoint()),
                attempt: attempts,
                timestamp: Utc::now(),
            }));

            match self.engine.fetch_url(url, target, session, stop).await {
                Ok(success) => {
                    if let Some(endpoint) = &success.proxy_used {
                        self.pool
                            .lock()
                            .await
                            .report(endpoint, true, Some(success.elapsed));
                    }
                    self.dispatcher
                        .dispatch(FetchEvent::TransferComplete(TransferCompleteEvent {
                            url: url.clone(),
                            bytes_transferred: success.bytes_transferred,
                            proxy: success.proxy_used.clone(),
                            elapsed: success.elapsed,
                            timestamp: Utc::now(),
                        }));
                    return FetchOutcome {
                        url: target.url.clone(),
                        destination: target.destination.clone(),
                        status: OutcomeStatus::Success,
                        bytes_transferred: success.bytes_transferred,
                        proxy_used: success.proxy_used,
                        attempts,
                        error_kind: None,
                        elapsed: started.elapsed(),
                        finished_at: Utc::now(),
                    };
                }
                Err(failure) => {
                    if let Some(endpoint) = &failure.proxy_used {
                        self.pool.lock().await.report(endpoint, false, None);
                    }
                    let retryable = failure.error.is_retryable();
                    let reason = failure.error.kind();
                    last_proxy = failure.proxy_used;
                    last_error = Some(failure.error);

                    if !retryable {
                        break;
                    }

                    // Never reuse the egress that just failed.
                    session.unbind_proxy();

                    if attempts < budget && !stop.is_stopped() {
                        let delay = backoff_delay(&self.config, attempts) + self.jitter();
                        self.dispatcher.dispatch(FetchEvent::Retry(RetryEvent {
                            url: url.clone(),
                            attempt: attempts,
                            reason,
                            scheduled_after: delay,
                            timestamp: Utc::now(),
                        }));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let error_kind = terminal_kind(last_error.as_ref(), attempts, budget);
        self.dispatcher
            .dispatch(FetchEvent::TargetFailed(TargetFailedEvent {
                url: target.url.clone(),
                error_kind,
                attempts,
                timestamp: Utc::now(),
            }));
        FetchOutcome {
            url: target.url.clone(),
            destination: target.destination.clone(),
            status: OutcomeStatus::Failed,
            bytes_transferred: 0,
            proxy_used: last_proxy,
            attempts,
            error_kind: Some(error_kind),
            elapsed: started.elapsed(),
            finished_at: Utc::now(),
        }
    }

    /// Primary URL `max_attempts` times, then each alternate once.
    fn attempt_plan(&self, target: &FetchTarget) -> Vec<Url> {
        let mut plan = Vec::with_capacity(self.config.max_attempts as usize + target.alternates.len());
        for _ in 0..self.config.max_attempts.max(1) {
            plan.push(target.url.clone());
        }
        plan.extend(target.alternates.iter().cloned());
        plan
    }

    fn jitter(&self) -> Duration {
        let max = self.config.backoff_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Kind surfaced on the terminal outcome. Plain transport failures that spent
/// the whole budget collapse into `ExhaustedRetries`; the more diagnostic
/// kinds survive as-is so callers can tell a blocking page from a dead link.
fn terminal_kind(last_error: Option<&TransferError>, attempts: u32, budget: u32) -> ErrorKind {
    match last_error {
        Some(TransferError::Transport(_)) if attempts >= budget => ErrorKind::ExhaustedRetries,
        Some(error) => error.kind(),
        None => ErrorKind::Transport,
    }
}
