//! HTTP transport seam for the transfer engine.
//!
//! The engine talks to the network through the [`TransferHttpClient`] trait
//! so tests can substitute a scripted transport. The reqwest-backed
//! implementation keeps one client per proxy endpoint, since a proxy is a
//! property of the client, not the request.

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferHttpError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
}

/// One outbound request as the engine describes it.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

/// Response head plus an incrementally consumable body.
pub struct TransferResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Box<dyn TransferBody>,
}

impl TransferResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

/// Pull-based body stream; `Ok(None)` marks the end of the payload.
#[async_trait]
pub trait TransferBody: Send {
    async fn chunk(&mut self) -> Result<Option<Bytes>, TransferHttpError>;
}

/// Transport abstraction the engine and tests share.
#[async_trait]
pub trait TransferHttpClient: Send + Sync {
    async fn send(&self, request: TransferRequest) -> Result<TransferResponse, TransferHttpError>;
}

/// Reqwest-backed transport with per-proxy client caching.
pub struct ReqwestTransferClient {
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestTransferClient {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client, TransferHttpError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| TransferHttpError::Transport(err.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| TransferHttpError::Transport(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransferClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferHttpClient for ReqwestTransferClient {
    async fn send(&self, request: TransferRequest) -> Result<TransferResponse, TransferHttpError> {
        let client = self.client(request.proxy.as_deref()).await?;

        let response = client
            .get(request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        Ok(TransferResponse {
            status,
            headers,
            body: Box::new(ReqwestBody(response)),
        })
    }
}

struct ReqwestBody(reqwest::Response);

#[async_trait]
impl TransferBody for ReqwestBody {
    async fn chunk(&mut self) -> Result<Option<Bytes>, TransferHttpError> {
        self.0.chunk().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransferHttpError {
    if err.is_timeout() {
        TransferHttpError::Timeout
    } else {
        TransferHttpError::Transport(err.to_string())
    }
}
