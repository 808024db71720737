//! Client seam for the external claims authority.
//!
//! The submission engine is the only caller. `HttpAuthorityClient` talks to
//! the real endpoint; `MockAuthorityClient` is the deterministic stand-in
//! selected by configuration, so sandbox and test environments never need to
//! patch source to avoid real submissions.

use crate::error::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

/// The payload POSTed to the authority's submit endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimSubmissionPayload {
    pub claim_id: String,
    pub order_id: String,
    pub sku: String,
    pub amount_cents: i64,
    pub evidence_ids: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritySubmitAck {
    pub submission_id: String,
    pub case_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionFields {
    pub outcome: Option<String>,
    pub payout_amount_cents: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub reference: Option<String>,
}

/// Status payload shape shared by the polling endpoint and inbound webhook
/// callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityStatus {
    pub status: String,
    #[serde(default)]
    pub resolution: Option<ResolutionFields>,
}

#[async_trait]
pub trait ClaimsAuthorityClient: Send + Sync {
    async fn submit(
        &self,
        payload: &ClaimSubmissionPayload,
    ) -> Result<AuthoritySubmitAck, PipelineError>;

    async fn status(
        &self,
        external_submission_id: &str,
    ) -> Result<AuthorityStatus, PipelineError>;
}

/// Classify an authority response status. Classification is by code class
/// only, never by message text: 429 and 5xx are retryable, other 4xx are
/// fatal.
pub fn classify_status(status: StatusCode, retry_after_seconds: Option<u64>) -> PipelineError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = Duration::from_secs(retry_after_seconds.unwrap_or(60));
        return PipelineError::transient_with_retry_after(
            format!("authority throttled ({status})"),
            retry_after,
        );
    }
    if status.is_server_error() {
        return PipelineError::transient(format!("authority server error ({status})"));
    }
    PipelineError::FatalExternal(format!("authority rejected the request ({status})"))
}

pub struct HttpAuthorityClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    submit_timeout: Duration,
    status_timeout: Duration,
}

impl HttpAuthorityClient {
    pub fn new(config: &crate::config::AuthorityConfig) -> Result<Self, PipelineError> {
        // Validate the base URL up front so misconfiguration fails at startup
        // instead of on the first submission.
        Url::parse(&config.base_url)
            .map_err(|e| PipelineError::validation(format!("authority base_url: {e}")))?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("claimflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::transient(format!("http client init: {e}")))?;

        Ok(HttpAuthorityClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            submit_timeout: Duration::from_secs(config.submit_timeout_seconds),
            status_timeout: Duration::from_secs(config.status_timeout_seconds),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn classify_transport_error(e: reqwest::Error) -> PipelineError {
        if e.is_timeout() {
            PipelineError::transient("authority call timed out")
        } else {
            PipelineError::transient(format!("authority unreachable: {e}"))
        }
    }

    fn retry_after_header(response: &reqwest::Response) -> Option<u64> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

#[async_trait]
impl ClaimsAuthorityClient for HttpAuthorityClient {
    async fn submit(
        &self,
        payload: &ClaimSubmissionPayload,
    ) -> Result<AuthoritySubmitAck, PipelineError> {
        log::debug!("submitting claim {} to authority", payload.claim_id);

        let mut request = self
            .client
            .post(self.endpoint("submit"))
            .timeout(self.submit_timeout)
            .json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::retry_after_header(&response);
            return Err(classify_status(status, retry_after));
        }

        response
            .json::<AuthoritySubmitAck>()
            .await
            .map_err(|e| PipelineError::transient(format!("malformed submit response: {e}")))
    }

    async fn status(
        &self,
        external_submission_id: &str,
    ) -> Result<AuthorityStatus, PipelineError> {
        log::debug!("checking authority status for {external_submission_id}");

        let mut request = self
            .client
            .get(self.endpoint(&format!("status/{external_submission_id}")))
            .timeout(self.status_timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::not_found(format!(
                "authority submission {external_submission_id}"
            )));
        }
        if !status.is_success() {
            let retry_after = Self::retry_after_header(&response);
            return Err(classify_status(status, retry_after));
        }

        response
            .json::<AuthorityStatus>()
            .await
            .map_err(|e| PipelineError::transient(format!("malformed status response: {e}")))
    }
}

/// Deterministic authority used by tests, demo runs, and sandbox deployments
/// (`authority.use_mock`). Outcomes are scripted per call; unscripted calls
/// succeed with predictable identifiers and an "under_review" status.
#[derive(Default)]
pub struct MockAuthorityClient {
    submit_outcomes: Mutex<VecDeque<Result<AuthoritySubmitAck, PipelineError>>>,
    statuses: Mutex<HashMap<String, AuthorityStatus>>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl MockAuthorityClient {
    pub fn new() -> Self {
        MockAuthorityClient::default()
    }

    /// Queue an outcome for the next submit call.
    pub fn push_submit_outcome(&self, outcome: Result<AuthoritySubmitAck, PipelineError>) {
        self.submit_outcomes
            .lock()
            .expect("mock lock")
            .push_back(outcome);
    }

    /// Set the status returned for an external submission id.
    pub fn set_status(&self, external_submission_id: &str, status: AuthorityStatus) {
        self.statuses
            .lock()
            .expect("mock lock")
            .insert(external_submission_id.to_string(), status);
    }

    pub fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::Relaxed)
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClaimsAuthorityClient for MockAuthorityClient {
    async fn submit(
        &self,
        payload: &ClaimSubmissionPayload,
    ) -> Result<AuthoritySubmitAck, PipelineError> {
        self.submit_calls.fetch_add(1, Ordering::Relaxed);

        let scripted = self.submit_outcomes.lock().expect("mock lock").pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(AuthoritySubmitAck {
                submission_id: format!("ext-{}", payload.claim_id),
                case_id: format!("case-{}", payload.claim_id),
            }),
        }
    }

    async fn status(
        &self,
        external_submission_id: &str,
    ) -> Result<AuthorityStatus, PipelineError> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);

        let statuses = self.statuses.lock().expect("mock lock");
        Ok(statuses
            .get(external_submission_id)
            .cloned()
            .unwrap_or(AuthorityStatus {
                status: "under_review".to_string(),
                resolution: None,
            }))
    }
}
