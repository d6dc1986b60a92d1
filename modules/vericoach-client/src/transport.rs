//! Typed client for the backend's run API.
//!
//! Wraps reqwest with one method per backend capability. Non-2xx responses
//! become `ClientError::Api` with the structured `detail` message extracted
//! from the body when possible; read endpoints map 404/409 to `NotReady` so
//! callers can distinguish "poll again later" from real failures.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use vericoach_common::protocol::{
    CancelResponse, ChannelTokenResponse, ListResponse, PromptResponse, StartRequest,
    StartResponse, StatusResponse, VerdictResponse,
};

use crate::error::{ClientError, Result};

/// Client for the run API. Reuses a single `reqwest::Client` for
/// connection pooling; a fixed request timeout applies to every call.
#[derive(Clone)]
pub struct RunApi {
    http: Client,
    base_url: String,
}

impl RunApi {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Submit a new verification run. The backend assigns the run id.
    pub async fn start(&self, req: &StartRequest) -> Result<StartResponse> {
        let url = format!("{}/runs", self.base_url);
        info!(url = url.as_str(), target = req.target.path(), "Starting verification run");

        let resp = self.http.post(&url).json(req).send().await?;
        check_json(resp).await
    }

    /// Current lifecycle state of a run.
    pub async fn status(&self, run_id: &str) -> Result<StatusResponse> {
        let url = format!("{}/runs/{run_id}/status", self.base_url);
        let resp = self.http.get(&url).send().await?;
        read_json(resp).await
    }

    /// Consensus verdict and patches. `ready: false` before completion.
    pub async fn verdict(&self, run_id: &str) -> Result<VerdictResponse> {
        let url = format!("{}/runs/{run_id}/verdict", self.base_url);
        let resp = self.http.get(&url).send().await?;
        read_json(resp).await
    }

    /// Synthesized remediation prompt, available once the run has a verdict.
    pub async fn prompt(&self, run_id: &str) -> Result<PromptResponse> {
        let url = format!("{}/runs/{run_id}/prompt", self.base_url);
        let resp = self.http.get(&url).send().await?;
        read_json(resp).await
    }

    /// Request cancellation. Idempotent against an already-terminal run:
    /// the backend answers `cancelled: false` with a message, not an error.
    pub async fn cancel(&self, run_id: &str) -> Result<CancelResponse> {
        let url = format!("{}/runs/{run_id}", self.base_url);
        info!(url = url.as_str(), run_id, "Cancelling run");

        let resp = self.http.delete(&url).send().await?;
        check_json(resp).await
    }

    /// Run history for list views.
    pub async fn list(&self) -> Result<ListResponse> {
        let url = format!("{}/runs", self.base_url);
        let resp = self.http.get(&url).send().await?;
        check_json(resp).await
    }

    /// Mint a short-lived, run-scoped token for the live channel.
    pub async fn channel_token(&self, run_id: &str) -> Result<ChannelTokenResponse> {
        let url = format!("{}/runs/{run_id}/channel-token", self.base_url);
        let resp = self.http.post(&url).send().await?;
        check_json(resp).await
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Parse a 2xx body, or turn any non-2xx into `Api` with the best message
/// the body offers.
async fn check_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        let parsed = resp.json().await.map_err(|e| ClientError::Parse(e.to_string()))?;
        return Ok(parsed);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message: extract_detail(&body, status),
    })
}

/// Like `check_json`, but 404/409 mean "not created / not ready yet" on
/// read endpoints and get their own variant.
async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::NotReady(extract_detail(&body, status)));
    }
    check_json(resp).await
}

/// Pull the `detail` field out of a structured error body, falling back to
/// the raw body, then to the HTTP status text.
pub(crate) fn extract_detail(body: &str, status: StatusCode) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(detail) = json.get("detail").and_then(|v| v.as_str()) {
            return detail.to_string();
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        debug!(status = status.as_u16(), "Error body had no detail field");
        return trimmed.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}
