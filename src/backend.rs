//! The two backend endpoints the poller depends on, behind one seam.
//!
//! `HttpBackend` talks to the real service with reqwest. Replies come back raw
//! (status code + body) and are interpreted in `protocol`.
//!
//! NOTE: bodies are only ever logged truncated.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::domain::{GenerationRequest, JobId};
use crate::util::trunc_for_log;

/// Status code and body of a backend reply, uninterpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawReply {
  pub status: u16,
  pub body: String,
}

impl RawReply {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// The request never produced a reply (connect, timeout, broken body).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      TransportError(format!("request timed out: {e}"))
    } else {
      TransportError(e.to_string())
    }
  }
}

/// Job submission and status lookup.
#[async_trait]
pub trait JobBackend: Send + Sync + 'static {
  async fn submit(&self, request: &GenerationRequest) -> Result<RawReply, TransportError>;

  async fn status(&self, id: &JobId) -> Result<RawReply, TransportError>;
}

#[derive(Clone)]
pub struct HttpBackend {
  pub client: reqwest::Client,
  pub base_url: String,
  pub submit_timeout: Duration,
  pub poll_timeout: Duration,
}

impl HttpBackend {
  pub fn new(base_url: impl Into<String>, submit_timeout: Duration, poll_timeout: Duration) -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()?;
    let base_url = base_url.into().trim_end_matches('/').to_string();
    Ok(Self { client, base_url, submit_timeout, poll_timeout })
  }

  pub fn jobs_url(&self) -> String {
    format!("{}/jobs", self.base_url)
  }

  pub fn job_url(&self, id: &JobId) -> String {
    format!("{}/jobs/{}", self.base_url, id)
  }

  async fn read(res: reqwest::Response) -> Result<RawReply, TransportError> {
    let status = res.status().as_u16();
    let body = res.text().await?;
    debug!(status, body = %trunc_for_log(&body, 300), "Backend reply");
    Ok(RawReply { status, body })
  }

  /// Forward an arbitrary JSON body to `POST /jobs`. Used by the relay's proxy route.
  #[instrument(level = "info", skip(self, body), fields(url = %self.jobs_url()))]
  pub async fn post_jobs_raw(&self, body: &serde_json::Value) -> Result<RawReply, TransportError> {
    let res = self
      .client
      .post(self.jobs_url())
      .timeout(self.submit_timeout)
      .header(USER_AGENT, "questgen-relay/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(ACCEPT, "application/json")
      .json(body)
      .send()
      .await
      .map_err(|e| {
        warn!(error = %e, "Job submission transport failure");
        TransportError::from(e)
      })?;
    Self::read(res).await
  }
}

#[async_trait]
impl JobBackend for HttpBackend {
  #[instrument(level = "info", skip(self, request), fields(difficulty = ?request.difficulty, category = %request.category))]
  async fn submit(&self, request: &GenerationRequest) -> Result<RawReply, TransportError> {
    let body = serde_json::to_value(request).map_err(|e| TransportError(e.to_string()))?;
    self.post_jobs_raw(&body).await
  }

  #[instrument(level = "debug", skip(self), fields(%id))]
  async fn status(&self, id: &JobId) -> Result<RawReply, TransportError> {
    let res = self
      .client
      .get(self.job_url(id))
      .timeout(self.poll_timeout)
      .header(USER_AGENT, "questgen-relay/0.1")
      .header(ACCEPT, "application/json")
      .send()
      .await?;
    Self::read(res).await
  }
}
