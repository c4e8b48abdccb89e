//! Proxy rotation and health tracking.
//!
//! Cycles egress candidates round-robin, quarantines repeat offenders, and
//! probes liveness lazily on first selection. Discovery stays external: the
//! pool pulls fresh candidates through a [`ProxySource`] only when nothing
//! is eligible.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// One egress candidate as ingested from the discovery feed.
#[derive(Debug, Clone)]
pub struct ProxyCandidate {
    pub address: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub last_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_used_at: Option<Instant>,
}

impl ProxyCandidate {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            protocol: ProxyProtocol::Http,
            last_latency: None,
            consecutive_failures: 0,
            last_used_at: None,
        }
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Parse the `host:port` lines proxy feeds commonly emit.
    pub fn parse(line: &str) -> Option<Self> {
        let (host, port) = line.trim().rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }

    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }
}

/// Pull-based discovery hook. The pool calls this when it runs out of
/// eligible candidates; it never scrapes proxy lists itself.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn fetch_candidates(&self) -> Vec<ProxyCandidate>;
}

/// Liveness check run once per candidate, on first selection.
/// Returns the observed latency, or `None` if the candidate is dead.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, candidate: &ProxyCandidate) -> Option<Duration>;
}

/// Reqwest-backed probe: fetch a known small resource through the candidate
/// within a bounded timeout.
pub struct HttpLivenessProbe {
    probe_url: Url,
    timeout: Duration,
}

impl HttpLivenessProbe {
    pub fn new(probe_url: Url, timeout: Duration) -> Self {
        Self { probe_url, timeout }
    }
}

impl Default for HttpLivenessProbe {
    fn default() -> Self {
        Self {
            probe_url: Url::parse("http://httpbin.org/ip").expect("static probe url"),
            timeout: Duration::from_secs(8),
        }
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn probe(&self, candidate: &ProxyCandidate) -> Option<Duration> {
        let proxy = reqwest::Proxy::all(candidate.endpoint()).ok()?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .ok()?;
        let started = Instant::now();
        match client.get(self.probe_url.clone()).send().await {
            Ok(response) if response.status().is_success() => Some(started.elapsed()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Consecutive failures before a candidate is quarantined.
    pub failure_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 25,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    candidate: ProxyCandidate,
    probed: bool,
    quarantined: bool,
}

impl PoolEntry {
    fn new(candidate: ProxyCandidate) -> Self {
        Self {
            candidate,
            probed: false,
            quarantined: false,
        }
    }
}

/// Pool-level health snapshot for diagnostics.
#[derive(Debug, Clone)]
pub struct PoolHealthReport {
    pub total: usize,
    pub eligible: usize,
    pub quarantined: usize,
}

/// Round-robin pool over non-quarantined candidates.
///
/// Shared across workers behind a mutex; every state transition goes through
/// `next_candidate`/`report` so two workers cannot corrupt a failure counter.
pub struct ProxyPool {
    config: PoolConfig,
    entries: Vec<PoolEntry>,
    cursor: usize,
    source: Option<Arc<dyn ProxySource>>,
    probe: Option<Arc<dyn LivenessProbe>>,
}

impl ProxyPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            cursor: 0,
            source: None,
            probe: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ProxySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn load<I>(&mut self, candidates: I)
    where
        I: IntoIterator<Item = ProxyCandidate>,
    {
        for candidate in candidates {
            self.add_candidate(candidate);
        }
    }

    pub fn add_candidate(&mut self, candidate: ProxyCandidate) {
        if self.entries.len() >= self.config.max_size {
            return;
        }
        let endpoint = candidate.endpoint();
        if self.entries.iter().any(|e| e.candidate.endpoint() == endpoint) {
            return;
        }
        self.entries.push(PoolEntry::new(candidate));
    }

    /// Next eligible candidate in rotation order, or `None` when the pool is
    /// exhausted (the caller then falls back to a direct connection).
    ///
    /// Unprobed candidates are probed here, on first selection; a candidate
    /// that fails its probe is quarantined and never promoted to eligible.
    pub async fn next_candidate(&mut self) -> Option<ProxyCandidate> {
        if self.eligible_count() == 0 {
            self.refresh().await;
        }

        let len = self.entries.len();
        if len == 0 {
            return None;
        }

        let probe = self.probe.clone();
        for _ in 0..len {
            let idx = self.cursor % len;
            self.cursor = self.cursor.wrapping_add(1);

            if self.entries[idx].quarantined {
                continue;
            }

            if !self.entries[idx].probed {
                match &probe {
                    Some(probe) => match probe.probe(&self.entries[idx].candidate).await {
                        Some(latency) => {
                            let entry = &mut self.entries[idx];
                            entry.probed = true;
                            entry.candidate.last_latency = Some(latency);
                        }
                        None => {
                            let entry = &mut self.entries[idx];
                            entry.quarantined = true;
                            log::debug!(
                                "proxy {} failed liveness probe, quarantined",
                                entry.candidate.endpoint()
                            );
                            continue;
                        }
                    },
                    None => self.entries[idx].probed = true,
                }
            }

            let entry = &mut self.entries[idx];
            entry.candidate.last_used_at = Some(Instant::now());
            return Some(entry.candidate.clone());
        }

        None
    }

    /// Record the result of using a candidate. Success resets the failure
    /// counter and stores the latency; failures accumulate and quarantine the
    /// candidate past the threshold, until the pool is refreshed.
    pub fn report(&mut self, endpoint: &str, success: bool, latency: Option<Duration>) {
        let threshold = self.config.failure_threshold;
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.candidate.endpoint() == endpoint)
        else {
            return;
        };

        if success {
            entry.candidate.consecutive_failures = 0;
            if let Some(latency) = latency {
                entry.candidate.last_latency = Some(latency);
            }
        } else {
            entry.candidate.consecutive_failures += 1;
            if entry.candidate.consecutive_failures >= threshold {
                entry.quarantined = true;
                log::info!(
                    "quarantined proxy {} after {} consecutive failures",
                    entry.candidate.endpoint(),
                    entry.candidate.consecutive_failures
                );
            }
        }
    }

    /// Discard quarantined entries and pull fresh candidates from the source.
    /// Returns how many candidates were added.
    pub async fn refresh(&mut self) -> usize {
        let Some(source) = self.source.clone() else {
            return 0;
        };

        self.entries.retain(|e| !e.quarantined);

        let mut added = 0;
        for candidate in source.fetch_candidates().await {
            if self.entries.len() >= self.config.max_size {
                break;
            }
            let endpoint = candidate.endpoint();
            if self.entries.iter().any(|e| e.candidate.endpoint() == endpoint) {
                continue;
            }
            self.entries.push(PoolEntry::new(candidate));
            added += 1;
        }

        if added > 0 {
            self.cursor = 0;
            log::debug!("proxy pool refreshed with {added} new candidates");
        }
        added
    }

    pub fn eligible_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.quarantined).count()
    }

    pub fn is_quarantined(&self, endpoint: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.quarantined && e.candidate.endpoint() == endpoint)
    }

    pub fn health_report(&self) -> PoolHealthReport {
        let quarantined = self.entries.iter().filter(|e| e.quarantined).count();
        PoolHealthReport {
            total: self.entries.len(),
            eligible: self.entries.len() - quarantined,
            quarantined,
        }
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
