//! Top-level orchestration: drives a worklist of targets through the retry
//! coordinator, sequentially or with a bounded set of workers, rotating
//! sessions and aggregating statistics along the way.

use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::engine::http::{ReqwestTransferClient, TransferHttpClient};
use crate::engine::retry::{RetryConfig, RetryCoordinator};
use crate::engine::session::Session;
use crate::engine::transfer::{TransferConfig, TransferEngine};
use crate::engine::types::{FetchOutcome, FetchTarget, OutcomeStatus, StopSignal};
use crate::modules::events::{
    EventDispatcher, EventHandler, FetchEvent, LoggingHandler, SessionRotatedEvent, StatsHandler,
};
use crate::modules::identity::{IdentityError, IdentityGenerator, ProfileSet};
use crate::modules::proxy::{
    LivenessProbe, PoolConfig, PoolHealthReport, ProxyCandidate, ProxyPool, ProxySource,
};
use crate::modules::stats::{RunSummary, StatsCollector, StatsSnapshot};
use crate::modules::timing::{TimingConfig, TimingController};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Worker count; 1 runs the worklist strictly sequentially.
    pub concurrency: usize,
    /// Skip targets whose destination already exists non-empty.
    pub skip_existing: bool,
    /// Shuffle the worklist before running it.
    pub shuffle_targets: bool,
    /// Apply the pacing delay between consecutive targets.
    pub pause_between_targets: bool,
    pub retry: RetryConfig,
    pub transfer: TransferConfig,
    pub timing: TimingConfig,
    pub pool: PoolConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            skip_existing: true,
            shuffle_targets: false,
            pause_between_targets: true,
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
            timing: TimingConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    proxies: Vec<ProxyCandidate>,
    proxy_source: Option<Arc<dyn ProxySource>>,
    liveness_probe: Option<Arc<dyn LivenessProbe>>,
    http_client: Option<Arc<dyn TransferHttpClient>>,
    profiles: Option<ProfileSet>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.config.concurrency = workers.max(1);
        self
    }

    pub fn skip_existing(mut self, skip: bool) -> Self {
        self.config.skip_existing = skip;
        self
    }

    pub fn shuffle_targets(mut self, shuffle: bool) -> Self {
        self.config.shuffle_targets = shuffle;
        self
    }

    pub fn pause_between_targets(mut self, pause: bool) -> Self {
        self.config.pause_between_targets = pause;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn transfer(mut self, transfer: TransferConfig) -> Self {
        self.config.transfer = transfer;
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.config.timing = timing;
        self
    }

    pub fn proxies<I>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = ProxyCandidate>,
    {
        self.proxies.extend(proxies);
        self
    }

    pub fn proxy_source(mut self, source: Arc<dyn ProxySource>) -> Self {
        self.proxy_source = Some(source);
        self
    }

    pub fn liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.liveness_probe = Some(probe);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn TransferHttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn browser_profiles(mut self, profiles: ProfileSet) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let mut pool = ProxyPool::new(self.config.pool.clone());
        if let Some(source) = self.proxy_source {
            pool = pool.with_source(source);
        }
        if let Some(probe) = self.liveness_probe {
            pool = pool.with_probe(probe);
        }
        pool.load(self.proxies);

        let identities = match self.profiles {
            Some(profiles) => IdentityGenerator::with_profiles(profiles)?,
            None => IdentityGenerator::new(),
        };

        let stats = StatsCollector::new();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.register_handler(Arc::new(StatsHandler::new(stats.clone())));
        for handler in self.handlers {
            dispatcher.register_handler(handler);
        }

        Ok(Orchestrator {
            config: self.config,
            http: self
                .http_client
                .unwrap_or_else(|| Arc::new(ReqwestTransferClient::new())),
            pool: Arc::new(Mutex::new(pool)),
            dispatcher: Arc::new(dispatcher),
            identities,
            stats,
            stop: StopSignal::new(),
        })
    }
}

/// Drives fetch targets to terminal outcomes.
pub struct Orchestrator {
    config: OrchestratorConfig,
    http: Arc<dyn TransferHttpClient>,
    pool: Arc<Mutex<ProxyPool>>,
    dispatcher: Arc<EventDispatcher>,
    identities: IdentityGenerator,
    stats: StatsCollector,
    stop: StopSignal,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn new(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::builder().config(config).build()
    }

    /// Handle for requesting a cooperative stop from another task.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn pool_health(&self) -> PoolHealthReport {
        self.pool.lock().await.health_report()
    }

    /// Run the worklist to completion. A single target's failure never aborts
    /// the run; every target ends in exactly one outcome.
    pub async fn run(&self, mut targets: Vec<FetchTarget>) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        let total = targets.len();
        log::info!(
            "starting run: {total} targets, {} worker(s)",
            self.config.concurrency.max(1)
        );

        if self.config.shuffle_targets {
            targets.shuffle(&mut rand::thread_rng());
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(targets)));
        let workers = self.config.concurrency.max(1).min(total.max(1));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let mut worker = self.worker();
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { worker.drain(queue).await }));
        }

        let mut outcomes = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok(chunk) => outcomes.extend(chunk),
                Err(err) => log::error!("worker task failed: {err}"),
            }
        }

        let summary = summarize(outcomes, started.elapsed());
        log::info!(
            "run finished: {} completed, {} failed, {} skipped, {} bytes in {:.1}s",
            summary.completed,
            summary.failed,
            summary.skipped,
            summary.total_bytes,
            summary.duration.as_secs_f64()
        );
        Ok(summary)
    }

    fn worker(&self) -> Worker {
        let engine = TransferEngine::new(
            Arc::clone(&self.http),
            Arc::clone(&self.pool),
            self.config.transfer.clone(),
        );
        let coordinator = RetryCoordinator::new(
            engine,
            Arc::clone(&self.pool),
            Arc::clone(&self.dispatcher),
            self.config.retry.clone(),
        );
        Worker {
            coordinator,
            timing: TimingController::new(self.config.timing.clone()),
            identities: self.identities.clone(),
            pool: Arc::clone(&self.pool),
            dispatcher: Arc::clone(&self.dispatcher),
            skip_existing: self.config.skip_existing,
            pause_between_targets: self.config.pause_between_targets,
            stop: self.stop.clone(),
            session: None,
        }
    }
}

/// One consumer of the shared worklist. Owns its timing controller and
/// session chain; only the proxy pool and dispatcher are shared.
struct Worker {
    coordinator: RetryCoordinator,
    timing: TimingController,
    identities: IdentityGenerator,
    pool: Arc<Mutex<ProxyPool>>,
    dispatcher: Arc<EventDispatcher>,
    skip_existing: bool,
    pause_between_targets: bool,
    stop: StopSignal,
    session: Option<Session>,
}

impl Worker {
    async fn drain(&mut self, queue: Arc<Mutex<VecDeque<FetchTarget>>>) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::new();
        let mut first = true;

        loop {
            if self.stop.is_stopped() {
                break;
            }
            let Some(target) = queue.lock().await.pop_front() else {
                break;
            };

            if self.skip_existing && destination_present(&target.destination) {
                log::debug!("skipping {}, destination already present", target.url);
                let outcome = FetchOutcome::skipped(&target);
                self.dispatcher.dispatch(FetchEvent::Outcome(outcome.clone()));
                outcomes.push(outcome);
                continue;
            }

            let mut session = match self.session.take() {
                Some(session) => session,
                None => match self.new_session().await {
                    Some(session) => session,
                    None => break,
                },
            };

            if self.pause_between_targets && !first {
                tokio::time::sleep(self.timing.next_delay(&session)).await;
            }
            first = false;

            // Re-bind after a coordinator unbound a failed egress.
            if session.bound_proxy.is_none() {
                session.bound_proxy = self.pool.lock().await.next_candidate().await;
            }

            let outcome = self
                .coordinator
                .fetch_with_retry(&target, &mut session, &self.stop)
                .await;
            if outcome.is_success() {
                session.record_download();
            }
            self.timing.record_outcome(outcome.is_success());

            if self.timing.should_rotate_session(&session) {
                self.dispatcher
                    .dispatch(FetchEvent::SessionRotated(SessionRotatedEvent {
                        downloads_served: session.downloads_this_session,
                        next_pattern: self.timing.roll_pattern(),
                        timestamp: Utc::now(),
                    }));
                self.session = self.new_session().await;
            } else {
                self.session = Some(session);
            }

            self.dispatcher.dispatch(FetchEvent::Outcome(outcome.clone()));
            outcomes.push(outcome);
        }

        outcomes
    }

    /// Fresh identity, re-rolled rotation threshold, fresh proxy binding.
    async fn new_session(&mut self) -> Option<Session> {
        let identity = match self.identities.generate() {
            Ok(identity) => identity,
            Err(err) => {
                log::error!("identity generation failed, stopping worker: {err}");
                return None;
            }
        };
        let threshold = self.timing.roll_rotation_threshold();
        let pattern = self.timing.roll_pattern();
        let bound_proxy = self.pool.lock().await.next_candidate().await;
        Some(Session::new(identity, bound_proxy, threshold, pattern))
    }
}

fn destination_present(path: &Path) -> bool {
    std::fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false)
}

fn summarize(outcomes: Vec<FetchOutcome>, duration: std::time::Duration) -> RunSummary {
    let mut completed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    let mut total_bytes = 0;
    for outcome in &outcomes {
        match outcome.status {
            OutcomeStatus::Success => completed += 1,
            OutcomeStatus::Failed => failed += 1,
            OutcomeStatus::Skipped => skipped += 1,
        }
        total_bytes += outcome.bytes_transferred;
    }
    RunSummary {
        completed,
        failed,
        skipped,
        total_bytes,
        duration,
        outcomes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_tallies_by_status() {
        use crate::engine::types::ErrorKind;
        use std::time::Duration;
        use url::Url;

        let outcome = |status, bytes, kind: Option<ErrorKind>| FetchOutcome {
            url: Url::parse("https://example.com/a.zip").unwrap(),
            destination: "a.zip".into(),
            status,
            bytes_transferred: bytes,
            proxy_used: None,
            attempts: 1,
            error_kind: kind,
            elapsed: Duration::from_secs(1),
            finished_at: Utc::now(),
        };

        let summary = summarize(
            vec![
                outcome(OutcomeStatus::Success, 2048, None),
                outcome(OutcomeStatus::Failed, 0, Some(ErrorKind::ExhaustedRetries)),
                outcome(OutcomeStatus::Skipped, 0, None),
            ],
            Duration::from_secs(5),
        );

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total_bytes, 2048);
        assert_eq!(summary.total_targets(), 3);
    }

    #[test]
    fn builder_rejects_zero_concurrency() {
        let orchestrator = Orchestrator::builder().concurrency(0).build().unwrap();
        assert_eq!(orchestrator.config.concurrency, 1);
    }
}
