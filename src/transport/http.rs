// src/transport/http.rs

//! Plain HTTP transport.
//!
//! Replays templates as form POSTs with `reqwest`. Captured requests come
//! from a JSON capture file (written by whatever drives the rendering
//! session) and are kept in a bounded [`CaptureBuffer`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{AppError, Result};
use crate::models::{RequestDescriptor, RequestTemplate, SessionConfig, TargetConfig};

use super::{CaptureBuffer, RequestFilter, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &SessionConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::config(format!("invalid value for header {name}: {e}")))?;
        headers.insert(name, value);
    }

    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .default_headers(headers)
        .build()?;
    Ok(client)
}

/// Transport over a plain HTTP client and a capture file.
pub struct HttpTransport {
    client: reqwest::Client,
    origin_url: String,
    capture_file: Option<PathBuf>,
    captures: CaptureBuffer,
}

impl HttpTransport {
    pub fn new(session: &SessionConfig, target: &TargetConfig) -> Result<Self> {
        if !session.headless {
            log::debug!("Visible session requested; plain HTTP transport has no window");
        }
        Ok(Self {
            client: create_async_client(session)?,
            origin_url: target.origin_url.clone(),
            capture_file: session.capture_file.clone(),
            captures: CaptureBuffer::new(session.capture_capacity),
        })
    }

    /// Record an observed request.
    pub fn capture(&mut self, request: RequestDescriptor) {
        self.captures.push(request);
    }

    /// Load every request from the capture file into the buffer.
    pub async fn load_capture_file(&mut self) -> Result<usize> {
        let Some(path) = &self.capture_file else {
            return Ok(0);
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::Io(e)),
        };
        let requests: Vec<RequestDescriptor> = serde_json::from_str(&content)?;
        let count = requests.len();
        self.captures.clear();
        for request in requests {
            self.captures.push(request);
        }
        log::debug!("Loaded {} captured request(s) from {}", count, path.display());
        Ok(count)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn discover_first_request(
        &mut self,
        filter: &RequestFilter,
        timeout: Duration,
    ) -> Result<RequestDescriptor> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(request) = self.captures.latest_matching(filter) {
                return Ok(request.clone());
            }
            if Instant::now() >= deadline {
                return Err(AppError::transport(
                    "discover",
                    format!("no matching request captured within {timeout:?}"),
                ));
            }
            self.load_capture_file().await?;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn replay(&mut self, request: &RequestTemplate) -> Result<String> {
        let response = self
            .client
            .post(&request.endpoint)
            .form(&request.to_form())
            .send()
            .await
            .map_err(|e| AppError::transport("replay", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::transport(
                "replay",
                format!("{} answered {}", request.endpoint, status),
            ));
        }
        response
            .text()
            .await
            .map_err(|e| AppError::transport("replay body", e))
    }

    async fn reload_origin(&mut self) -> Result<()> {
        if !self.origin_url.is_empty() {
            let status = self
                .client
                .get(&self.origin_url)
                .send()
                .await
                .map_err(|e| AppError::transport("reload", e))?
                .status();
            log::info!("Reloaded {} ({})", self.origin_url, status);
        }
        self.load_capture_file().await?;
        Ok(())
    }

    async fn nudge(&mut self) -> Result<()> {
        log::debug!("Nudge requested; nothing to scroll over plain HTTP");
        Ok(())
    }
}
