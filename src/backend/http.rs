//! REST generation backend.
//!
//! Talks to a generation gateway with three endpoints:
//! - `POST {base}/v1/analyze`: optional pre-processing (video only)
//! - `POST {base}/v1/generations`: submit, answers `{id, secondary_id?}`
//! - `GET  {base}/v1/generations/{id}`: status, answers a [`StatusReport`]
//!
//! Upstream ids are sent as single percent-encoded path segments.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{GenerationBackend, JobHandles, StatusReport};
use crate::error::CollaboratorError;
use crate::jobs::model::{GenerationRequest, JobKind};

/// Per-request timeout. A slow status check is a transient failure, not a hang.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in a [`CollaboratorError::Http`] message.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: Option<String>,
    #[serde(default)]
    secondary_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    request: GenerationRequest,
}

/// [`GenerationBackend`] over HTTP + JSON.
pub struct HttpGenerationBackend {
    base_url: Url,
    api_key: SecretString,
    analyze_kinds: Vec<JobKind>,
    client: reqwest::Client,
}

impl HttpGenerationBackend {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CollaboratorError::Transport(format!("Failed to build HTTP client: {e}")))?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url).map_err(|e| {
            CollaboratorError::Transport(format!("Invalid backend URL {base_url:?}: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CollaboratorError::Transport(format!(
                "Backend URL {base_url} cannot be a base"
            )));
        }

        Ok(Self {
            base_url,
            api_key,
            analyze_kinds: vec![JobKind::Video],
            client,
        })
    }

    /// Override which kinds go through `/v1/analyze` first.
    pub fn with_analysis_for(mut self, kinds: impl IntoIterator<Item = JobKind>) -> Self {
        self.analyze_kinds = kinds.into_iter().collect();
        self
    }

    /// `segments` appended to the base path, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, CollaboratorError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                CollaboratorError::Transport(format!("{} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Turn a non-2xx response into an HTTP error carrying its status code.
    async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, CollaboratorError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            body.chars().take(MAX_ERROR_BODY).collect()
        };

        Err(CollaboratorError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    fn requires_analysis(&self, kind: JobKind) -> bool {
        self.analyze_kinds.contains(&kind)
    }

    async fn analyze(
        &self,
        kind: JobKind,
        request: GenerationRequest,
    ) -> Result<GenerationRequest, CollaboratorError> {
        let body = serde_json::json!({
            "kind": kind,
            "request": request,
        });

        let resp = self
            .client
            .post(self.url(&["v1", "analyze"])?)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let resp = Self::error_for_status(resp).await?;
        let parsed: AnalyzeResponse = resp.json().await?;

        debug!(kind = %kind, "Analysis complete");
        Ok(parsed.request)
    }

    async fn submit(
        &self,
        kind: JobKind,
        request: &GenerationRequest,
    ) -> Result<JobHandles, CollaboratorError> {
        let body = serde_json::json!({
            "kind": kind,
            "request": request,
        });

        let resp = self
            .client
            .post(self.url(&["v1", "generations"])?)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let resp = Self::error_for_status(resp).await?;
        let parsed: SubmitResponse = resp.json().await?;

        let external_id = parsed
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| CollaboratorError::UpstreamFailed("submission returned no job id".into()))?;

        debug!(kind = %kind, external_id = %external_id, "Generation submitted");
        Ok(JobHandles {
            external_id,
            secondary_id: parsed.secondary_id,
        })
    }

    async fn check_status(&self, handles: &JobHandles) -> Result<StatusReport, CollaboratorError> {
        let mut req = self
            .client
            .get(self.url(&["v1", "generations", handles.external_id.as_str()])?)
            .bearer_auth(self.api_key.expose_secret());
        if let Some(ref secondary) = handles.secondary_id {
            req = req.query(&[("secondary_id", secondary)]);
        }

        let resp = Self::error_for_status(req.send().await?).await?;
        Ok(resp.json().await?)
    }
}
