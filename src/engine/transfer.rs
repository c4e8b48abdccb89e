//! Single-attempt resource transfer.
//!
//! One `fetch` call performs exactly one streamed request: egress and
//! identity selection, range-based resume, content validation against
//! blocking pages, and incremental writes to the destination. Retrying is
//! the coordinator's job, one layer up.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use url::Url;

use super::http::{TransferHttpClient, TransferHttpError, TransferRequest};
use super::session::Session;
use super::types::{ExpectedKind, FetchTarget, StopSignal, TransferError};
use crate::modules::proxy::ProxyPool;

/// Markup document openers that mark a response as a blocking/error page
/// when binary payload was expected. Matched case-insensitively after an
/// optional BOM and leading whitespace.
static MARKUP_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i-u)^(\xEF\xBB\xBF)?\s*<(!doctype|html|head|body|title|script)")
        .expect("static markup regex")
});

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bound on a single attempt, connect through last byte.
    pub attempt_timeout: Duration,
    /// Fall back to a direct connection when the pool is exhausted.
    pub allow_direct: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(300),
            allow_direct: true,
        }
    }
}

/// Result of one successful attempt.
#[derive(Debug, Clone)]
pub struct TransferSuccess {
    /// Bytes written by this attempt (excludes resumed bytes).
    pub bytes_transferred: u64,
    /// Size of the partial file this attempt continued from.
    pub resumed_from: u64,
    /// Final on-disk size of the destination.
    pub total_size: u64,
    pub proxy_used: Option<String>,
    pub elapsed: Duration,
}

/// Result of one failed attempt, with enough context to report the proxy.
#[derive(Debug)]
pub struct AttemptFailure {
    pub error: TransferError,
    pub proxy_used: Option<String>,
    pub elapsed: Duration,
}

/// Performs one resource fetch end-to-end.
pub struct TransferEngine {
    http: Arc<dyn TransferHttpClient>,
    pool: Arc<Mutex<ProxyPool>>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        http: Arc<dyn TransferHttpClient>,
        pool: Arc<Mutex<ProxyPool>>,
        config: TransferConfig,
    ) -> Self {
        Self { http, pool, config }
    }

    /// Fetch the target's primary URL. Single attempt, no retry.
    pub async fn fetch(
        &self,
        target: &FetchTarget,
        session: &Session,
        stop: &StopSignal,
    ) -> Result<TransferSuccess, AttemptFailure> {
        self.fetch_url(&target.url, target, session, stop).await
    }

    /// Fetch an explicit URL for the target (primary or alternate source).
    pub async fn fetch_url(
        &self,
        url: &Url,
        target: &FetchTarget,
        session: &Session,
        stop: &StopSignal,
    ) -> Result<TransferSuccess, AttemptFailure> {
        let started = Instant::now();

        let proxy = match self.select_egress(session).await {
            Ok(proxy) => proxy,
            Err(error) => {
                return Err(AttemptFailure {
                    error,
                    proxy_used: None,
                    elapsed: started.elapsed(),
                });
            }
        };

        match self.attempt(url, target, session, proxy.clone(), stop).await {
            Ok((written, resumed_from)) => Ok(TransferSuccess {
                bytes_transferred: written,
                resumed_from,
                total_size: resumed_from + written,
                proxy_used: proxy,
                elapsed: started.elapsed(),
            }),
            Err(error) => Err(AttemptFailure {
                error,
                proxy_used: proxy,
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Session binding first, then the pool, then direct if permitted.
    async fn select_egress(&self, session: &Session) -> Result<Option<String>, TransferError> {
        if let Some(candidate) = &session.bound_proxy {
            return Ok(Some(candidate.endpoint()));
        }
        let mut pool = self.pool.lock().await;
        match pool.next_candidate().await {
            Some(candidate) => Ok(Some(candidate.endpoint())),
            None if self.config.allow_direct => {
                log::debug!("proxy pool exhausted, falling back to direct connection");
                Ok(None)
            }
            None => Err(TransferError::PoolExhausted),
        }
    }

    async fn attempt(
        &self,
        url: &Url,
        target: &FetchTarget,
        session: &Session,
        proxy: Option<String>,
        stop: &StopSignal,
    ) -> Result<(u64, u64), TransferError> {
        let mut resume_from = match tokio::fs::metadata(&target.destination).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut headers = session.identity.header_map();
        if resume_from > 0 {
            let range = format!("bytes={resume_from}-");
            headers.insert(
                http::header::RANGE,
                range
                    .parse()
                    .map_err(|_| TransferError::Transport("invalid range header".into()))?,
            );
            log::debug!("resuming {url} from byte {resume_from}");
        }

        let response = self
            .http
            .send(TransferRequest {
                url: url.clone(),
                headers,
                proxy,
                timeout: self.config.attempt_timeout,
            })
            .await
            .map_err(map_http_error)?;

        match response.status {
            206 => {}
            200 => {
                if resume_from > 0 {
                    // Remote ignored the range request: restart from zero
                    // rather than corrupting the file by appending.
                    log::debug!("{url} ignored range request, restarting from zero");
                    resume_from = 0;
                }
            }
            status => {
                return Err(TransferError::Transport(format!(
                    "unexpected status {status}"
                )));
            }
        }

        let declared_total = response.content_length().map(|len| resume_from + len);
        let content_type = response.content_type().map(|ct| ct.to_ascii_lowercase());
        let mut body = response.body;

        // Peek at the first chunk before touching the destination so a
        // blocking page never reaches the final path.
        let first = body.chunk().await.map_err(map_http_error)?;
        if target.expected_kind == ExpectedKind::Binary {
            if let Some(content_type) = &content_type
                && declares_text(content_type)
            {
                let markup = first
                    .as_deref()
                    .is_none_or(|chunk| MARKUP_SIGNATURE.is_match(chunk));
                if markup {
                    return Err(TransferError::ContentMismatch(format!(
                        "expected binary payload, got `{content_type}`"
                    )));
                }
            }
        }

        if let Some(parent) = target.destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = if resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&target.destination)
                .await?
        } else {
            tokio::fs::File::create(&target.destination).await?
        };

        let mut written = 0u64;
        let mut next = first;
        while let Some(chunk) = next {
            if stop.is_stopped() {
                // Leave the partial intact for a future resume.
                file.flush().await?;
                return Err(TransferError::Cancelled);
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            next = body.chunk().await.map_err(map_http_error)?;
        }
        file.flush().await?;

        if let Some(total) = declared_total {
            let final_size = resume_from + written;
            if final_size != total {
                return Err(TransferError::Transport(format!(
                    "truncated response: {final_size} of {total} bytes"
                )));
            }
        }

        Ok((written, resume_from))
    }
}

fn declares_text(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.contains("html")
        || content_type.contains("xml")
}

fn map_http_error(err: TransferHttpError) -> TransferError {
    match err {
        TransferHttpError::Timeout => TransferError::Transport("request timed out".into()),
        TransferHttpError::Transport(msg) => TransferError::Transport(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http::{TransferBody, TransferResponse};
    use crate::engine::types::ErrorKind;
    use crate::modules::identity::IdentityGenerator;
    use crate::modules::timing::PacingProfile;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::HeaderMap;
    use std::collections::VecDeque;

    struct ScriptedBody(VecDeque<Bytes>);

    #[async_trait]
    impl TransferBody for ScriptedBody {
        async fn chunk(&mut self) -> Result<Option<Bytes>, TransferHttpError> {
            Ok(self.0.pop_front())
        }
    }

    #[derive(Clone)]
    struct ScriptedResponse {
        status: u16,
        content_type: Option<&'static str>,
        content_length: Option<u64>,
        chunks: Vec<Bytes>,
    }

    struct ScriptedClient {
        responses: std::sync::Mutex<VecDeque<ScriptedResponse>>,
        requests: std::sync::Mutex<Vec<TransferRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<ScriptedResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses.into()),
                requests: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn request_headers(&self, index: usize) -> HeaderMap {
            self.requests.lock().unwrap()[index].headers.clone()
        }
    }

    #[async_trait]
    impl TransferHttpClient for ScriptedClient {
        async fn send(
            &self,
            request: TransferRequest,
        ) -> Result<TransferResponse, TransferHttpError> {
            self.requests.lock().unwrap().push(request);
            let scripted = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransferHttpError::Transport("script exhausted".into()))?;

            let mut headers = HeaderMap::new();
            if let Some(ct) = scripted.content_type {
                headers.insert(http::header::CONTENT_TYPE, ct.parse().unwrap());
            }
            if let Some(len) = scripted.content_length {
                headers.insert(http::header::CONTENT_LENGTH, len.to_string().parse().unwrap());
            }
            Ok(TransferResponse {
                status: scripted.status,
                headers,
                body: Box::new(ScriptedBody(scripted.chunks.into())),
            })
        }
    }

    fn session() -> Session {
        let identity = IdentityGenerator::new().generate().unwrap();
        Session::new(identity, None, 10, PacingProfile::Normal)
    }

    fn engine(client: Arc<ScriptedClient>, allow_direct: bool) -> TransferEngine {
        TransferEngine::new(
            client,
            Arc::new(Mutex::new(ProxyPool::default())),
            TransferConfig {
                attempt_timeout: Duration::from_secs(5),
                allow_direct,
            },
        )
    }

    fn target_in(dir: &tempfile::TempDir, name: &str) -> FetchTarget {
        FetchTarget::new(
            Url::parse("https://archive.example/roms/game.zip").unwrap(),
            dir.path().join(name),
            ExpectedKind::Binary,
        )
    }

    #[tokio::test]
    async fn streams_payload_to_destination() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![ScriptedResponse {
            status: 200,
            content_type: Some("application/zip"),
            content_length: Some(8),
            chunks: vec![Bytes::from_static(b"PK\x03\x04"), Bytes::from_static(b"data")],
        }]);
        let target = target_in(&dir, "game.zip");

        let success = engine(client, true)
            .fetch(&target, &session(), &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(success.bytes_transferred, 8);
        assert_eq!(success.total_size, 8);
        assert_eq!(std::fs::read(&target.destination).unwrap(), b"PK\x03\x04data");
    }

    #[tokio::test]
    async fn blocking_page_is_content_mismatch_and_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![ScriptedResponse {
            status: 200,
            content_type: Some("text/html; charset=utf-8"),
            content_length: Some(20),
            chunks: vec![Bytes::from_static(b"<html>blocked</html>")],
        }]);
        let target = target_in(&dir, "game.zip");

        let failure = engine(client, true)
            .fetch(&target, &session(), &StopSignal::new())
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::ContentMismatch);
        assert!(!target.destination.exists());
    }

    #[tokio::test]
    async fn textual_declaration_with_binary_body_passes_through() {
        // Some mirrors mislabel archives; only a markup body marks a block page.
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![ScriptedResponse {
            status: 200,
            content_type: Some("text/plain"),
            content_length: Some(4),
            chunks: vec![Bytes::from_static(b"PK\x03\x04")],
        }]);
        let target = target_in(&dir, "game.zip");

        let success = engine(client, true)
            .fetch(&target, &session(), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(success.bytes_transferred, 4);
    }

    #[tokio::test]
    async fn resumes_with_range_header_and_completes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let target = target_in(&dir, "game.zip");
        std::fs::write(&target.destination, b"12345").unwrap();

        let client = ScriptedClient::new(vec![ScriptedResponse {
            status: 206,
            content_type: Some("application/octet-stream"),
            content_length: Some(5),
            chunks: vec![Bytes::from_static(b"67890")],
        }]);
        let engine = engine(client.clone(), true);

        let success = engine
            .fetch(&target, &session(), &StopSignal::new())
            .await
            .unwrap();

        let range = client.request_headers(0);
        assert_eq!(
            range.get(http::header::RANGE).unwrap().to_str().unwrap(),
            "bytes=5-"
        );
        assert_eq!(success.resumed_from, 5);
        assert_eq!(success.total_size, 10);
        assert_eq!(std::fs::read(&target.destination).unwrap(), b"1234567890");
    }

    #[tokio::test]
    async fn ignored_range_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let target = target_in(&dir, "game.zip");
        std::fs::write(&target.destination, b"stale").unwrap();

        let client = ScriptedClient::new(vec![ScriptedResponse {
            status: 200,
            content_type: Some("application/octet-stream"),
            content_length: Some(10),
            chunks: vec![Bytes::from_static(b"freshbytes")],
        }]);

        let success = engine(client, true)
            .fetch(&target, &session(), &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(success.resumed_from, 0);
        assert_eq!(std::fs::read(&target.destination).unwrap(), b"freshbytes");
    }

    #[tokio::test]
    async fn truncated_body_is_transport_error_and_keeps_partial() {
        let dir = tempfile::tempdir().unwrap();
        let target = target_in(&dir, "game.zip");

        let client = ScriptedClient::new(vec![ScriptedResponse {
            status: 200,
            content_type: Some("application/octet-stream"),
            content_length: Some(100),
            chunks: vec![Bytes::from_static(b"only-this")],
        }]);

        let failure = engine(client, true)
            .fetch(&target, &session(), &StopSignal::new())
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::Transport);
        assert_eq!(std::fs::read(&target.destination).unwrap(), b"only-this");
    }

    #[tokio::test]
    async fn empty_pool_without_direct_fallback_is_pool_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![]);
        let target = target_in(&dir, "game.zip");

        let failure = engine(client, false)
            .fetch(&target, &session(), &StopSignal::new())
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::PoolExhausted);
    }

    #[test]
    fn markup_signatures_match_case_insensitively() {
        assert!(MARKUP_SIGNATURE.is_match(b"<!DOCTYPE html>"));
        assert!(MARKUP_SIGNATURE.is_match(b"  \n<HTML>"));
        assert!(MARKUP_SIGNATURE.is_match(b"\xEF\xBB\xBF<html>"));
        assert!(!MARKUP_SIGNATURE.is_match(b"PK\x03\x04"));
        assert!(!MARKUP_SIGNATURE.is_match(b"plain text body"));
    }
}
