//! Vigil status sink: pushes a derived pod status to an external endpoint.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vigil_core::DerivedStatus;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("invalid status endpoint url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("encoding status report: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("status request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("status endpoint returned {code}")]
    Status { code: u16 },
}

/// Body sent to the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub name: String,
    pub id: String,
    pub status: DerivedStatus,
}

/// Receives the derived status of a pod. Any error makes the reconciliation retryable.
#[async_trait::async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, name: &str, id: &str, status: DerivedStatus) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Full endpoint URL; the report is sent as `PATCH <url>`.
    pub url: String,
    /// Appended as the `token` query parameter when set.
    pub token: Option<String>,
    /// Accept self-signed certificates (local/dev clusters).
    pub insecure_tls: bool,
    pub timeout: Duration,
}

impl SinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), token: None, insecure_tls: false, timeout: Duration::from_secs(30) }
    }
}

pub struct HttpStatusSink {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpStatusSink {
    pub fn new(cfg: SinkConfig) -> Result<Self, SinkError> {
        let invalid = |reason: String| SinkError::InvalidUrl { url: cfg.url.clone(), reason };
        if cfg.url.trim().is_empty() { return Err(invalid("url is empty".into())); }
        let mut url = reqwest::Url::parse(cfg.url.trim()).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        if let Some(token) = cfg.token.as_deref().filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .danger_accept_invalid_certs(cfg.insecure_tls)
            .build()
            .map_err(SinkError::Client)?;
        info!(host = url.host_str().unwrap_or(""), insecure_tls = cfg.insecure_tls, "status sink configured");
        Ok(Self { client, url })
    }
}

#[async_trait::async_trait]
impl StatusSink for HttpStatusSink {
    async fn report(&self, name: &str, id: &str, status: DerivedStatus) -> Result<(), SinkError> {
        let report = StatusReport { name: name.to_string(), id: id.to_string(), status };
        let body = serde_json::to_vec(&report)?;
        debug!(name, id, %status, "patching status");
        let started = Instant::now();
        let result = self
            .client
            .patch(self.url.clone())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        histogram!("vigil_sink_request_ms", started.elapsed().as_secs_f64() * 1000.0);
        let resp = result.map_err(|e| {
            counter!("vigil_sink_errors_total", 1, "reason" => "transport");
            SinkError::Transport(e)
        })?;
        let code = resp.status();
        if !code.is_success() {
            counter!("vigil_sink_errors_total", 1, "reason" => "status");
            return Err(SinkError::Status { code: code.as_u16() });
        }
        info!(name, id, %status, "status reported");
        Ok(())
    }
}

/// Sink that only logs; used for dry runs.
#[derive(Debug, Default)]
pub struct LogStatusSink;

#[async_trait::async_trait]
impl StatusSink for LogStatusSink {
    async fn report(&self, name: &str, id: &str, status: DerivedStatus) -> Result<(), SinkError> {
        info!(name, id, %status, "status (dry run)");
        Ok(())
    }
}
