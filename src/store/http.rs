//! Remote authoritative result store over HTTP.
//!
//! - `PUT {base}/results/{owner}` with `{"job_id": ..., "result": ...}`
//! - `GET {base}/results/{owner}` answers the same shape, 404 when unset
//!
//! The owner key is sent as a single percent-encoded path segment.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::JobKey;
use crate::store::traits::{OwnerResult, ResultStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize, Deserialize)]
struct ResultBody {
    job_id: Uuid,
    result: String,
}

pub struct HttpResultStore {
    base_url: Url,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpResultStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<SecretString>) -> Result<Self, DatabaseError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DatabaseError::Remote(format!("Failed to build HTTP client: {e}")))?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| DatabaseError::Remote(format!("Invalid result store URL {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DatabaseError::Remote(format!(
                "Result store URL {base_url} cannot be a base"
            )));
        }

        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    fn result_url(&self, owner: &JobKey) -> Result<Url, DatabaseError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DatabaseError::Remote(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push("results")
            .push(owner.as_str());
        Ok(url)
    }

    fn request(
        &self,
        method: reqwest::Method,
        owner: &JobKey,
    ) -> Result<reqwest::RequestBuilder, DatabaseError> {
        let req = self.client.request(method, self.result_url(owner)?);
        Ok(match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        })
    }
}

#[async_trait]
impl ResultStore for HttpResultStore {
    async fn persist_result(
        &self,
        owner: &JobKey,
        job_id: Uuid,
        result: &str,
    ) -> Result<(), DatabaseError> {
        let resp = self
            .request(reqwest::Method::PUT, owner)?
            .json(&ResultBody {
                job_id,
                result: result.to_string(),
            })
            .send()
            .await
            .map_err(|e| DatabaseError::Remote(format!("persist_result: {e}")))?;

        if !resp.status().is_success() {
            return Err(DatabaseError::Remote(format!(
                "persist_result: HTTP {}",
                resp.status().as_u16()
            )));
        }

        debug!(owner = %owner, "Result persisted remotely");
        Ok(())
    }

    async fn fetch_result(&self, owner: &JobKey) -> Result<Option<OwnerResult>, DatabaseError> {
        let resp = self
            .request(reqwest::Method::GET, owner)?
            .send()
            .await
            .map_err(|e| DatabaseError::Remote(format!("fetch_result: {e}")))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ResultBody = resp
                    .json()
                    .await
                    .map_err(|e| DatabaseError::Serialization(format!("fetch_result: {e}")))?;
                Ok(Some(OwnerResult {
                    job_id: body.job_id,
                    result: body.result,
                }))
            }
            status => Err(DatabaseError::Remote(format!(
                "fetch_result: HTTP {}",
                status.as_u16()
            ))),
        }
    }
}
