//! # bulkfetch
//!
//! A resilient bulk-download orchestrator for large, rate-limited archives.
//!
//! Targets flow through a retry coordinator and a streaming transfer engine
//! backed by a self-healing proxy pool, coherent per-session browser
//! identities, and human-like pacing. Failed candidates are quarantined,
//! partial downloads resume with range requests, and blocking pages are
//! rejected before they ever reach the destination path.
//!
//! ## Features
//!
//! - Round-robin proxy rotation with failure quarantine and pool refresh
//! - Coherent browser header identities, replaced wholesale on rotation
//! - Pacing profiles with stochastic switches and failure-driven caution
//! - Range-request resume and strict content validation for binary targets
//! - Bounded retries with exponential backoff and alternate mirror URLs
//! - Sequential or bounded-concurrency orchestration with run statistics
//!
//! ## Example
//!
//! ```no_run
//! use bulkfetch::{ExpectedKind, FetchTarget, Orchestrator, ProxyCandidate};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = ProxyCandidate::parse("203.0.113.10:8080").ok_or("bad proxy line")?;
//!     let orchestrator = Orchestrator::builder()
//!         .proxies([proxy])
//!         .concurrency(2)
//!         .build()?;
//!
//!     let targets = vec![FetchTarget::new(
//!         Url::parse("https://archive.example/files/payload.zip")?,
//!         "downloads/payload.zip",
//!         ExpectedKind::Binary,
//!     )];
//!
//!     let summary = orchestrator.run(targets).await?;
//!     println!("{} of {} completed", summary.completed, summary.total_targets());
//!     Ok(())
//! }
//! ```

mod orchestrator;

pub mod engine;
pub mod modules;

pub use crate::orchestrator::{
    Orchestrator,
    OrchestratorBuilder,
    OrchestratorConfig,
    OrchestratorError,
};

pub use crate::engine::http::{
    ReqwestTransferClient,
    TransferBody,
    TransferHttpClient,
    TransferHttpError,
    TransferRequest,
    TransferResponse,
};

pub use crate::engine::retry::{RetryConfig, RetryCoordinator, backoff_delay};

pub use crate::engine::session::Session;

pub use crate::engine::transfer::{
    AttemptFailure,
    TransferConfig,
    TransferEngine,
    TransferSuccess,
};

pub use crate::engine::types::{
    ErrorKind,
    ExpectedKind,
    FetchOutcome,
    FetchTarget,
    OutcomeStatus,
    StopSignal,
    TransferError,
};

pub use crate::modules::events::{
    EventDispatcher,
    EventHandler,
    FetchEvent,
    LoggingHandler,
    PreRequestEvent,
    RetryEvent,
    SessionRotatedEvent,
    StatsHandler,
    TargetFailedEvent,
    TransferCompleteEvent,
};

pub use crate::modules::identity::{
    BrowserProfile,
    Identity,
    IdentityError,
    IdentityGenerator,
    ProfileSet,
};

pub use crate::modules::proxy::{
    HttpLivenessProbe,
    LivenessProbe,
    PoolConfig,
    PoolHealthReport,
    ProxyCandidate,
    ProxyPool,
    ProxyProtocol,
    ProxySource,
};

pub use crate::modules::stats::{RunSummary, StatsCollector, StatsSnapshot};

pub use crate::modules::timing::{PacingProfile, TimingConfig, TimingController};
