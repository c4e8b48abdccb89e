//! Transfer pipeline: shared types, the HTTP seam, sessions, the single
//! attempt engine, and the retry layer above it.

pub mod http;
pub mod retry;
pub mod session;
pub mod transfer;
pub mod types;

pub use http::{ReqwestTransferClient, TransferHttpClient};
pub use retry::{RetryConfig, RetryCoordinator};
pub use session::Session;
pub use transfer::{TransferConfig, TransferEngine};
pub use types::{
    ErrorKind, ExpectedKind, FetchOutcome, FetchTarget, OutcomeStatus, StopSignal, TransferError,
};
