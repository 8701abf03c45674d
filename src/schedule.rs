//! Poll timing: the backoff policy and the poller's own bookkeeping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay and ceiling parameters of a poll cycle.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub multiplier: f64,
  /// Attempts polled at the base delay before the delay starts growing.
  pub warmup_attempts: u32,
  /// Total polls per cycle before giving up with a timeout.
  pub max_attempts: u32,
  /// Consecutive failed polls absorbed silently; one more ends the cycle.
  pub max_consecutive_failures: u32,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base_delay_ms: 3_000,
      max_delay_ms: 15_000,
      multiplier: 1.5,
      warmup_attempts: 5,
      max_attempts: 40,
      max_consecutive_failures: 5,
    }
  }
}

/// Per-cycle counters. Reset on every submission and retry.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
  pub attempt_count: u32,
  pub current_delay_ms: u64,
  pub consecutive_failures: u32,
  pub is_active: bool,
}

/// What to do after a non-terminal tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
  PollAfter(Duration),
  GiveUp,
}

impl PollState {
  pub fn idle(policy: &BackoffPolicy) -> Self {
    Self { attempt_count: 0, current_delay_ms: policy.base_delay_ms, consecutive_failures: 0, is_active: false }
  }

  pub fn started(policy: &BackoffPolicy) -> Self {
    Self { is_active: true, ..Self::idle(policy) }
  }

  pub fn current_delay(&self) -> Duration {
    Duration::from_millis(self.current_delay_ms)
  }

  /// Count one issued poll.
  pub fn record_attempt(&mut self) {
    self.attempt_count += 1;
  }

  /// Count a failed poll. Returns true while the failure is still tolerated.
  pub fn record_failure(&mut self, policy: &BackoffPolicy) -> bool {
    self.consecutive_failures += 1;
    self.consecutive_failures <= policy.max_consecutive_failures
  }

  pub fn record_success(&mut self) {
    self.consecutive_failures = 0;
  }

  /// Decide the next step once a tick ended without a terminal status, growing
  /// the delay once past the warm-up window.
  pub fn advance(&mut self, policy: &BackoffPolicy) -> Next {
    if self.attempt_count >= policy.max_attempts {
      return Next::GiveUp;
    }
    if self.attempt_count > policy.warmup_attempts {
      let grown = (self.current_delay_ms as f64 * policy.multiplier).round() as u64;
      self.current_delay_ms = grown.min(policy.max_delay_ms);
    }
    Next::PollAfter(self.current_delay())
  }

  /// Like [`PollState::advance`] but without growing the delay. Used after a
  /// failed poll.
  pub fn hold(&self, policy: &BackoffPolicy) -> Next {
    if self.attempt_count >= policy.max_attempts {
      return Next::GiveUp;
    }
    Next::PollAfter(self.current_delay())
  }
}
