//! Wire formats: backend replies for `/jobs` and `/jobs/{id}`, and the
//! WebSocket messages exchanged with the UI.
//!
//! Backend replies are interpreted here and nowhere else, so the poller only
//! sees typed results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::RawReply;
use crate::domain::{GenerationRequest, Job, JobId, JobStatus};
use crate::error::PollerError;
use crate::poller::PollEvent;
use crate::util::trunc_for_log;

/// Submission reply body. Every field is optional because the backend is not
/// consistent about which ones it sends on errors.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    #[serde(default)] content_id: Option<Value>,
    #[serde(default)] id: Option<Value>,
    #[serde(default)] fallback_content_id: Option<Value>,
    #[serde(default)] status: Option<String>,
    #[serde(default)] message: Option<String>,
    #[serde(default)] error: Option<Value>,
}

/// Status reply body: `{content: {status, message?, error?, ...}}`.
#[derive(Debug, Deserialize)]
struct StatusBody {
    content: Value,
}

/// An accepted submission.
#[derive(Clone, Debug, PartialEq)]
pub struct Accepted {
    pub job: Job,
    /// Set when the backend reported an error but still handed out a fallback id.
    pub warning: Option<String>,
}

/// A parsed status poll.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub status: JobStatus,
    pub message: Option<String>,
    pub error: Option<String>,
    /// The full `content` object, used as the result payload on success.
    pub content: Value,
}

/// Render an `error` field that may be a string or a structured object.
fn error_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(v.to_string())),
        other => Some(other.to_string()),
    }
}

/// Turn a submission reply into an accepted job or a typed error.
pub fn interpret_submission(reply: &RawReply) -> Result<Accepted, PollerError> {
    let parsed = serde_json::from_str::<SubmitBody>(&reply.body);

    if !reply.is_success() {
        let body = parsed.unwrap_or_default();
        let message = body
            .message
            .clone()
            .or_else(|| body.error.as_ref().and_then(error_text))
            .unwrap_or_else(|| format!("HTTP {}: {}", reply.status, trunc_for_log(&reply.body, 200)));
        return match body.fallback_content_id.as_ref().and_then(JobId::from_json) {
            Some(id) => Ok(Accepted { job: accepted_job(id, body.status.as_deref(), None), warning: Some(message) }),
            None => Err(PollerError::Submission { status: Some(reply.status), message }),
        };
    }

    let body = parsed.map_err(|e| PollerError::Protocol(format!("unparseable submission reply: {e}")))?;
    let primary = body.content_id.as_ref().or(body.id.as_ref()).and_then(JobId::from_json);
    if let Some(id) = primary {
        return Ok(Accepted { job: accepted_job(id, body.status.as_deref(), body.message), warning: None });
    }
    match body.fallback_content_id.as_ref().and_then(JobId::from_json) {
        Some(id) => {
            let warning = body
                .message
                .clone()
                .or_else(|| body.error.as_ref().and_then(error_text))
                .unwrap_or_else(|| "backend returned a fallback job id".to_string());
            Ok(Accepted { job: accepted_job(id, body.status.as_deref(), None), warning: Some(warning) })
        }
        None => Err(PollerError::Protocol("submission reply carries no job id".into())),
    }
}

fn accepted_job(id: JobId, status: Option<&str>, message: Option<String>) -> Job {
    let mut job = Job::new(id, status.map(JobStatus::parse).unwrap_or(JobStatus::Queued));
    // A submission reply never settles the job; polling decides that.
    if job.status.is_terminal() {
        job.status = JobStatus::Queued;
    }
    job.progress_message = message.unwrap_or_else(|| "Generation queued".to_string());
    job
}

/// Parse one status poll. Any `Err` counts as a failed tick.
pub fn interpret_status(reply: &RawReply) -> Result<StatusReport, String> {
    if !reply.is_success() {
        return Err(format!("HTTP {}: {}", reply.status, trunc_for_log(&reply.body, 200)));
    }
    let body: StatusBody =
        serde_json::from_str(&reply.body).map_err(|e| format!("unparseable status reply: {e}"))?;
    let Value::Object(fields) = &body.content else {
        return Err("status reply `content` is not an object".into());
    };
    let status = fields
        .get("status")
        .and_then(Value::as_str)
        .map(JobStatus::parse)
        .ok_or_else(|| "status reply carries no status".to_string())?;
    let message = fields.get("message").and_then(Value::as_str).map(str::to_string);
    let error = fields.get("error").and_then(error_text);
    Ok(StatusReport { status, message, error, content: body.content })
}

//
// WebSocket messages
//

/// Messages the UI can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    Generate(GenerationRequest),
    Cancel,
    Retry,
}

/// Messages the relay sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    /// The poller event's own fields (and its `kind` tag) sit next to `type`.
    Event {
        #[serde(flatten)]
        event: PollEvent,
    },
    Error { message: String, retryable: bool },
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
}
