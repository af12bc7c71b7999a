//! HTTP client for the skilld daemon.

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use skill_core::messages::SkillListPayload;
use skill_core::types::{PassReport, SchedulerSnapshot};
use skill_core::Message;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: skilld\n  → or set SKILLD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid JSON payload: {0}")]
    InvalidPayload(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check SKILLD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("event stream closed")]
    StreamClosed,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure skilld is running\n  → check SKILLD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Response from POST /bus/{event}.
#[derive(Debug, Deserialize)]
pub struct PublishResponse {
    pub event: String,
    pub delivered: usize,
}

/// Response from GET /status.
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub scheduler: SchedulerSnapshot,
    pub last_pass: Option<PassReport>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for skilld.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Check if the daemon answers on /health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            if let Ok(true) = self.check_health().await {
                return Ok(());
            }

            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed >= timeout_ms {
                return Err(ClientError::DaemonNotReady {
                    addr: self.base_url.clone(),
                    timeout_ms,
                });
            }

            eprintln!(
                "waiting for daemon at {} (retrying in {}ms)",
                self.base_url, backoff_ms
            );

            let remaining = timeout_ms.saturating_sub(elapsed);
            tokio::time::sleep(Duration::from_millis(backoff_ms.min(remaining))).await;
            backoff_ms = backoff_ms.saturating_mul(2);
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        ClientError::HttpError { status, message }
    }

    /// Publish a message on the daemon bus.
    /// POST /bus/{event}
    pub async fn publish(
        &self,
        event: &str,
        data: Option<&Value>,
    ) -> Result<PublishResponse, ClientError> {
        let url = format!("{}/bus/{}", self.base_url, event);
        let mut request = self.http.post(&url).headers(self.headers());
        if let Some(data) = data {
            request = request.json(data);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// GET /status
    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        self.get_json("status").await
    }

    /// GET /skills
    pub async fn skills(&self) -> Result<SkillListPayload, ClientError> {
        self.get_json("skills").await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Open the bus event stream.
    /// GET /bus/events?prefix=...
    ///
    /// The daemon subscribes before the response headers are sent, so anything
    /// published after this returns is seen by the stream.
    pub async fn events(&self, prefix: Option<&str>) -> Result<EventStream, ClientError> {
        let url = format!("{}/bus/events", self.base_url);
        let mut request = self.http.get(&url).headers(self.headers());
        if let Some(prefix) = prefix {
            request = request.query(&[("prefix", prefix)]);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        Ok(EventStream {
            chunks: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            buffer: String::new(),
        })
    }
}

/// Bus messages decoded from an SSE response.
pub struct EventStream {
    chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: String,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Next bus message, or `None` once the daemon closes the stream.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ClientError> {
        loop {
            // Events are separated by a blank line.
            while let Some(end) = self.buffer.find("\n\n") {
                let event_str = self.buffer[..end].to_string();
                self.buffer.drain(..end + 2);
                if let Some(msg) = parse_sse_message(&event_str) {
                    return Ok(Some(msg));
                }
            }

            match self.chunks.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                None => return Ok(None),
            }
        }
    }
}

/// Parse one SSE event into a bus message. Keepalives and comments yield `None`.
fn parse_sse_message(event_str: &str) -> Option<Message> {
    let data: Vec<&str> = event_str
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect();
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(&data.join("\n")).ok()
}
