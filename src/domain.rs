//! Domain models: generation requests, job identity, job status and the
//! status classifier every other module goes through.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How hard the generated quest should be.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
  Beginner,
  Intermediate,
  Advanced,
  Expert,
}
impl Default for Difficulty {
  fn default() -> Self { Difficulty::Beginner }
}

/// Parameters of one job submission. Serialized as the `/jobs` request body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
  #[serde(default)]
  pub difficulty: Difficulty,
  pub category: String,
  #[serde(default)]
  pub required_points: u32,
  #[serde(default)]
  pub reward_points: u32,
  /// Persist the generated quest right away instead of holding it for review.
  #[serde(default)]
  pub auto_create: bool,
}

/// Opaque job identifier. The backend hands out strings or integers; both are
/// kept as their textual form and never interpreted.
#[derive(Clone, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }

  /// Accepts a JSON string or number. Empty strings, nulls and anything else are rejected.
  pub fn from_json(v: &Value) -> Option<Self> {
    match v {
      Value::String(s) if !s.trim().is_empty() => Some(Self(s.trim().to_string())),
      Value::Number(n) => Some(Self(n.to_string())),
      _ => None,
    }
  }
}

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Status label reported by the backend.
///
/// The backend uses several near-synonyms for "done"; see [`classify`] for how
/// they collapse into a [`Verdict`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
  Queued,
  Processing,
  Completed,
  Approved,
  Pending,
  Failed,
  Error,
  /// A label we do not know yet. Treated as still running.
  Other(String),
}

impl JobStatus {
  pub fn parse(label: &str) -> Self {
    match label.trim().to_ascii_lowercase().as_str() {
      "queued" => JobStatus::Queued,
      "processing" => JobStatus::Processing,
      "completed" => JobStatus::Completed,
      "approved" => JobStatus::Approved,
      "pending" => JobStatus::Pending,
      "failed" => JobStatus::Failed,
      "error" => JobStatus::Error,
      _ => JobStatus::Other(label.trim().to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Processing => "processing",
      JobStatus::Completed => "completed",
      JobStatus::Approved => "approved",
      JobStatus::Pending => "pending",
      JobStatus::Failed => "failed",
      JobStatus::Error => "error",
      JobStatus::Other(s) => s,
    }
  }

  pub fn is_terminal(&self) -> bool {
    classify(self, false) != Verdict::InProgress
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl Serialize for JobStatus {
  fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for JobStatus {
  fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    Ok(JobStatus::parse(&s))
  }
}

/// Where a status leaves the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
  InProgress,
  Success,
  Failure,
}

/// The one place status labels are mapped to terminal states.
///
/// `pending` counts as success: the backend reports it for quests that were
/// generated but held for manual review. An attached error field fails the
/// job whatever the label says.
pub fn classify(status: &JobStatus, has_error: bool) -> Verdict {
  if has_error {
    return Verdict::Failure;
  }
  match status {
    JobStatus::Completed | JobStatus::Approved | JobStatus::Pending => Verdict::Success,
    JobStatus::Failed | JobStatus::Error => Verdict::Failure,
    JobStatus::Queued | JobStatus::Processing | JobStatus::Other(_) => Verdict::InProgress,
  }
}

/// Server-side unit of work as last observed by the poller.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
  pub id: JobId,
  pub status: JobStatus,
  pub progress_message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_detail: Option<String>,
}

impl Job {
  pub fn new(id: JobId, status: JobStatus) -> Self {
    Self { id, status, progress_message: String::new(), result: None, error_detail: None }
  }

  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal() || self.error_detail.is_some()
  }

  /// Apply a freshly polled status. Returns false (and changes nothing) once the
  /// job already sits in a terminal state.
  pub fn apply(&mut self, status: JobStatus, message: Option<String>) -> bool {
    if self.is_terminal() {
      return false;
    }
    self.status = status;
    if let Some(m) = message {
      self.progress_message = m;
    }
    true
  }
}
