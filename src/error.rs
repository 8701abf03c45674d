//! Error taxonomy for the poller.
//!
//! Nothing here escapes the poll loop as a panic: every tick's failure is
//! classified into one of these and either counted or turned into a terminal
//! outcome.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollerError {
  /// Job creation failed at the transport level, or the backend refused it
  /// without handing back a usable id. No polling starts.
  #[error("submission failed: {message}")]
  Submission { status: Option<u16>, message: String },

  /// The backend answered with something we could not use.
  #[error("malformed backend response: {0}")]
  Protocol(String),

  /// Too many consecutive polls failed in transit.
  #[error("lost contact with backend after {failures} consecutive failures: {message}")]
  Communication { failures: u32, message: String },

  /// The backend reported the job as failed.
  #[error("job failed: {0}")]
  JobFailure(String),

  /// Attempt ceiling reached without a terminal status. The job may still
  /// finish server-side.
  #[error("generation is taking longer than expected ({attempts} attempts)")]
  Timeout { attempts: u32 },

  #[error("nothing to retry")]
  RetryUnavailable,

  /// A newer submission replaced this one while it was in flight.
  #[error("superseded by a newer submission")]
  Superseded,
}

impl PollerError {
  /// Whether the UI should offer a retry action for this error.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      PollerError::Communication { .. } | PollerError::JobFailure(_) | PollerError::Timeout { .. }
    )
  }
}
