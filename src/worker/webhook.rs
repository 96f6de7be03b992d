//! Stage handler that delegates the work to an HTTP service.
//!
//! Each stage job is POSTed to `{base_url}/{stage}`; the response status
//! decides whether the job completes, retries or is dead-lettered.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use super::handler::{HandlerOutcome, JobHandler};
use crate::error::JobError;
use crate::queue::{Job, JobPayload};

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct WebhookRequest<'a> {
    job_id: &'a str,
    attempt: u32,
    payload: &'a JobPayload,
}

/// Forwards stage jobs to an HTTP endpoint.
pub struct WebhookHandler {
    client: Client,
    base_url: String,
}

impl WebhookHandler {
    /// Creates a handler posting to `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, job: &Job) -> Result<String, JobError> {
        let stage = job.payload.stage().ok_or_else(|| {
            JobError::Validation(format!("job {} is not a stage job", job.id))
        })?;
        Ok(format!("{}/{}", self.base_url, stage))
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let url = self.endpoint(job)?;
        let body = WebhookRequest {
            job_id: job.id.as_str(),
            attempt: job.attempts,
            payload: &job.payload,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        debug!(job_id = %job.id, url = %url, status = status.as_u16(), "Webhook responded");

        if status.is_success() {
            return Ok(HandlerOutcome::Done);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();

        Err(status_error(status, retry_after, &text))
    }
}

/// Maps a non-success response to a job error.
fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> JobError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return JobError::RateLimited { retry_after };
    }

    let mut message: String = body.chars().take(MAX_ERROR_BODY).collect();
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("no body").to_string();
    }
    JobError::upstream(status.as_u16(), message)
}

fn request_error(err: reqwest::Error) -> JobError {
    if err.is_timeout() {
        JobError::Timeout(err.to_string())
    } else {
        JobError::Unavailable(err.to_string())
    }
}
