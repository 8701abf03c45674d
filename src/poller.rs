//! `JobPoller`: drives one generation job from submission to a terminal outcome.
//!
//! Each accepted submission starts a poll cycle on its own tokio task. The
//! cycle sleeps, polls, classifies the reply and reschedules itself; only one
//! poll is ever in flight. Every cycle captures a generation number; `submit`
//! and `cancel` bump it under the state lock, and the cycle re-checks it after
//! each sleep and before applying each reply, so a replaced or cancelled cycle
//! can neither issue another request nor mutate state.
//!
//! Observers get a broadcast stream of [`PollEvent`]s and can read the current
//! [`PollSnapshot`] at any time.

use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{JobBackend, RawReply, TransportError};
use crate::domain::{classify, GenerationRequest, Job, JobId, JobStatus, Verdict};
use crate::error::PollerError;
use crate::protocol::{interpret_status, interpret_submission, StatusReport};
use crate::schedule::{BackoffPolicy, Next, PollState};

const EVENT_CAPACITY: usize = 256;

fn as_display<S: Serializer>(e: &PollerError, s: S) -> Result<S::Ok, S::Error> {
  s.collect_str(e)
}

/// Intermediate status after a non-terminal poll.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
  pub job_id: JobId,
  pub status: JobStatus,
  pub progress_message: String,
  pub attempt_count: u32,
  pub next_delay_ms: u64,
}

/// Degraded conditions that do not stop the flow.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Warning {
  /// The backend reported an error on submission but handed out a fallback id.
  FallbackId { job_id: JobId, message: String },
  /// A poll failed in transit; the cycle carries on.
  TransientFailure { job_id: JobId, consecutive: u32, message: String },
}

/// How a poll cycle ended.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
  Succeeded { job: Job, result: Value },
  Failed {
    job: Job,
    #[serde(serialize_with = "as_display")]
    error: PollerError,
  },
  /// Attempt ceiling reached. The job may still finish server-side.
  TimedOut { job: Job, attempts: u32 },
}

impl Outcome {
  pub fn job(&self) -> &Job {
    match self {
      Outcome::Succeeded { job, .. } | Outcome::Failed { job, .. } | Outcome::TimedOut { job, .. } => job,
    }
  }

  pub fn retry_available(&self) -> bool {
    !matches!(self, Outcome::Succeeded { .. })
  }

  /// The error shown to the user, if any.
  pub fn error(&self) -> Option<PollerError> {
    match self {
      Outcome::Succeeded { .. } => None,
      Outcome::Failed { error, .. } => Some(error.clone()),
      Outcome::TimedOut { attempts, .. } => Some(PollerError::Timeout { attempts: *attempts }),
    }
  }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollEvent {
  Submitted { job: Job },
  Rejected {
    #[serde(serialize_with = "as_display")]
    error: PollerError,
  },
  Warning { warning: Warning },
  Update { update: JobStatusUpdate },
  /// Exactly one per poll cycle.
  Finished { outcome: Outcome, retry_available: bool },
  Cancelled { job_id: Option<JobId> },
}

/// Point-in-time view of the poller.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
  pub job: Option<Job>,
  pub poll: PollState,
  pub retry_available: bool,
  pub last_outcome: Option<Outcome>,
}

struct Shared {
  job: Option<Job>,
  poll: PollState,
  last_request: Option<GenerationRequest>,
  retry_available: bool,
  last_outcome: Option<Outcome>,
  task: Option<JoinHandle<()>>,
}

struct Inner<B> {
  backend: Arc<B>,
  policy: BackoffPolicy,
  generation: AtomicU64,
  state: Mutex<Shared>,
  events: broadcast::Sender<PollEvent>,
}

impl<B> Inner<B> {
  /// Must be called with the state lock held.
  fn bump_generation(&self) -> u64 {
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn is_current(&self, generation: u64) -> bool {
    self.generation.load(Ordering::SeqCst) == generation
  }

  fn emit(&self, event: PollEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }

  fn finish(&self, st: &mut Shared, outcome: Outcome) {
    st.poll.is_active = false;
    st.retry_available = outcome.retry_available();
    st.last_outcome = Some(outcome.clone());
    st.task = None;
    let retry_available = st.retry_available;
    self.emit(PollEvent::Finished { outcome, retry_available });
  }
}

fn default_progress(status: &JobStatus) -> &'static str {
  match status {
    JobStatus::Queued => "Waiting for a generation slot",
    JobStatus::Processing => "Generating quest content",
    _ => "Working on it",
  }
}

/// Owns the lifecycle of one asynchronous generation request at a time.
pub struct JobPoller<B: JobBackend> {
  inner: Arc<Inner<B>>,
}

impl<B: JobBackend> Clone for JobPoller<B> {
  fn clone(&self) -> Self {
    Self { inner: self.inner.clone() }
  }
}

impl<B: JobBackend> JobPoller<B> {
  pub fn new(backend: Arc<B>, policy: BackoffPolicy) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let state = Shared {
      job: None,
      poll: PollState::idle(&policy),
      last_request: None,
      retry_available: false,
      last_outcome: None,
      task: None,
    };
    Self {
      inner: Arc::new(Inner { backend, policy, generation: AtomicU64::new(0), state: Mutex::new(state), events }),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
    self.inner.events.subscribe()
  }

  pub async fn snapshot(&self) -> PollSnapshot {
    let st = self.inner.state.lock().await;
    PollSnapshot {
      job: st.job.clone(),
      poll: st.poll,
      retry_available: st.retry_available,
      last_outcome: st.last_outcome.clone(),
    }
  }

  /// Submit a request and start polling the job it creates. Replaces any
  /// cycle already running on this poller.
  #[instrument(level = "info", skip(self, request), fields(difficulty = ?request.difficulty, category = %request.category))]
  pub async fn submit(&self, request: GenerationRequest) -> Result<Job, PollerError> {
    let inner = &self.inner;
    let generation = {
      let mut st = inner.state.lock().await;
      let generation = inner.bump_generation();
      if let Some(task) = st.task.take() {
        task.abort();
        debug!(generation, "Replaced running poll cycle");
      }
      st.job = None;
      st.poll = PollState::started(&inner.policy);
      st.last_request = Some(request.clone());
      st.retry_available = false;
      st.last_outcome = None;
      generation
    };

    let reply = inner.backend.submit(&request).await;

    let mut st = inner.state.lock().await;
    if !inner.is_current(generation) {
      debug!(generation, "Submission reply arrived after replacement; ignoring");
      return Err(PollerError::Superseded);
    }

    let accepted = match reply
      .map_err(|e| PollerError::Submission { status: None, message: e.to_string() })
      .and_then(|r| interpret_submission(&r))
    {
      Ok(a) => a,
      Err(e) => {
        st.poll.is_active = false;
        error!(generation, error = %e, "Job submission failed");
        inner.emit(PollEvent::Rejected { error: e.clone() });
        return Err(e);
      }
    };

    let job = accepted.job;
    info!(generation, job_id = %job.id, status = %job.status, "Job accepted; polling");
    st.job = Some(job.clone());
    inner.emit(PollEvent::Submitted { job: job.clone() });
    if let Some(message) = accepted.warning {
      warn!(job_id = %job.id, %message, "Backend reported an error but returned a fallback id");
      inner.emit(PollEvent::Warning { warning: Warning::FallbackId { job_id: job.id.clone(), message } });
    }

    let first_delay = st.poll.current_delay();
    st.task = Some(tokio::spawn(run_cycle(inner.clone(), generation, job.id.clone(), first_delay)));
    Ok(job)
  }

  /// Stop polling. The last known job is kept for display. Idempotent.
  #[instrument(level = "info", skip(self))]
  pub async fn cancel(&self) {
    let inner = &self.inner;
    let mut st = inner.state.lock().await;
    inner.bump_generation();
    if let Some(task) = st.task.take() {
      task.abort();
    }
    let was_active = st.poll.is_active;
    st.poll = PollState::idle(&inner.policy);
    if was_active {
      let job_id = st.job.as_ref().map(|j| j.id.clone());
      info!(job_id = ?job_id.as_ref().map(|j| j.to_string()), "Polling cancelled");
      inner.emit(PollEvent::Cancelled { job_id });
    }
  }

  /// Submit the last request again. Only offered after a timeout or a failure.
  #[instrument(level = "info", skip(self))]
  pub async fn retry(&self) -> Result<Job, PollerError> {
    let request = {
      let st = self.inner.state.lock().await;
      if !st.retry_available {
        return Err(PollerError::RetryUnavailable);
      }
      st.last_request.clone().ok_or(PollerError::RetryUnavailable)?
    };
    self.submit(request).await
  }
}

/// One poll cycle. Returns once the cycle ends or is invalidated.
async fn run_cycle<B: JobBackend>(inner: Arc<Inner<B>>, generation: u64, id: JobId, first_delay: Duration) {
  let mut delay = first_delay;
  loop {
    tokio::time::sleep(delay).await;

    let attempt = {
      let mut st = inner.state.lock().await;
      if !inner.is_current(generation) || !st.poll.is_active {
        return;
      }
      st.poll.record_attempt();
      st.poll.attempt_count
    };
    debug!(job_id = %id, attempt, "Polling job status");

    let reply = inner.backend.status(&id).await;

    let mut st = inner.state.lock().await;
    if !inner.is_current(generation) {
      debug!(job_id = %id, attempt, "Dropping stale poll reply");
      return;
    }
    match apply_tick(&inner, &mut st, &id, reply) {
      Some(next) => delay = next,
      None => return,
    }
  }
}

/// Classify one poll reply and update state. Returns the delay before the next
/// poll, or `None` once the cycle has ended.
fn apply_tick<B>(
  inner: &Inner<B>,
  st: &mut Shared,
  id: &JobId,
  reply: Result<RawReply, TransportError>,
) -> Option<Duration> {
  let policy = &inner.policy;
  let parsed = reply.map_err(|e| e.to_string()).and_then(|r| interpret_status(&r));

  let progressed = match parsed {
    Err(cause) => {
      if st.poll.record_failure(policy) {
        let consecutive = st.poll.consecutive_failures;
        warn!(job_id = %id, consecutive, error = %cause, "Status poll failed; will retry");
        inner.emit(PollEvent::Warning {
          warning: Warning::TransientFailure { job_id: id.clone(), consecutive, message: cause },
        });
      } else {
        let failures = st.poll.consecutive_failures;
        error!(job_id = %id, failures, error = %cause, "Giving up after repeated poll failures");
        let job = st.job.clone().unwrap_or_else(|| Job::new(id.clone(), JobStatus::Queued));
        inner.finish(st, Outcome::Failed { job, error: PollerError::Communication { failures, message: cause } });
        return None;
      }
      false
    }
    Ok(report) => {
      st.poll.record_success();
      if let Some(done) = settle(st, id, report) {
        match &done {
          Outcome::Succeeded { .. } => info!(job_id = %id, attempts = st.poll.attempt_count, "Job completed"),
          _ => warn!(job_id = %id, attempts = st.poll.attempt_count, "Job failed"),
        }
        inner.finish(st, done);
        return None;
      }
      true
    }
  };

  // A failed tick keeps the current delay and reports nothing new.
  let attempts = st.poll.attempt_count;
  let next = if progressed { st.poll.advance(policy) } else { st.poll.hold(policy) };
  match next {
    Next::PollAfter(delay) => {
      if let (true, Some(job)) = (progressed, &st.job) {
        inner.emit(PollEvent::Update {
          update: JobStatusUpdate {
            job_id: job.id.clone(),
            status: job.status.clone(),
            progress_message: job.progress_message.clone(),
            attempt_count: attempts,
            next_delay_ms: delay.as_millis() as u64,
          },
        });
      }
      debug!(job_id = %id, attempt = attempts, delay_ms = delay.as_millis() as u64, "Next poll scheduled");
      Some(delay)
    }
    Next::GiveUp => {
      warn!(job_id = %id, attempts, "Attempt ceiling reached; generation is taking longer than expected");
      let job = st.job.clone().unwrap_or_else(|| Job::new(id.clone(), JobStatus::Queued));
      inner.finish(st, Outcome::TimedOut { job, attempts });
      None
    }
  }
}

/// Fold a parsed status into the current job. Returns the outcome when the job
/// reached a terminal state.
fn settle(st: &mut Shared, id: &JobId, report: StatusReport) -> Option<Outcome> {
  let job = st.job.get_or_insert_with(|| Job::new(id.clone(), JobStatus::Queued));
  let verdict = classify(&report.status, report.error.is_some());
  let message = report
    .message
    .clone()
    .or_else(|| (verdict == Verdict::InProgress).then(|| default_progress(&report.status).to_string()));
  job.apply(report.status, message);

  match verdict {
    Verdict::InProgress => None,
    Verdict::Success => {
      job.result = Some(report.content.clone());
      Some(Outcome::Succeeded { job: job.clone(), result: report.content })
    }
    Verdict::Failure => {
      let detail = report
        .error
        .or(report.message)
        .unwrap_or_else(|| format!("backend reported status `{}`", job.status));
      job.error_detail = Some(detail.clone());
      Some(Outcome::Failed { job: job.clone(), error: PollerError::JobFailure(detail) })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex as StdMutex;

  use async_trait::async_trait;
  use serde_json::json;
  use tokio::sync::Notify;
  use tokio::time::Instant;

  use crate::domain::Difficulty;

  enum Step {
    Reply(Result<RawReply, TransportError>),
    Gated(Arc<Notify>, Result<RawReply, TransportError>),
  }

  /// In-memory backend replaying scripted replies. Once the status script is
  /// exhausted every poll answers `processing`.
  #[derive(Default)]
  struct ScriptedBackend {
    submit_replies: StdMutex<VecDeque<Result<RawReply, TransportError>>>,
    status_steps: StdMutex<VecDeque<Step>>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    polled: StdMutex<Vec<(JobId, Instant)>>,
  }

  impl ScriptedBackend {
    fn on_submit(self, reply: Result<RawReply, TransportError>) -> Self {
      self.submit_replies.lock().unwrap().push_back(reply);
      self
    }

    fn on_status(self, step: Step) -> Self {
      self.status_steps.lock().unwrap().push_back(step);
      self
    }

    fn polls(&self) -> usize {
      self.polls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl JobBackend for ScriptedBackend {
    async fn submit(&self, _request: &GenerationRequest) -> Result<RawReply, TransportError> {
      self.submits.fetch_add(1, Ordering::SeqCst);
      self.submit_replies.lock().unwrap().pop_front().unwrap_or_else(|| ok(json!({"contentId": "auto", "status": "queued"})))
    }

    async fn status(&self, id: &JobId) -> Result<RawReply, TransportError> {
      self.polls.fetch_add(1, Ordering::SeqCst);
      self.polled.lock().unwrap().push((id.clone(), Instant::now()));
      let step = self.status_steps.lock().unwrap().pop_front();
      match step {
        Some(Step::Reply(r)) => r,
        Some(Step::Gated(gate, r)) => {
          gate.notified().await;
          r
        }
        None => ok(json!({"content": {"status": "processing"}})),
      }
    }
  }

  fn ok(body: Value) -> Result<RawReply, TransportError> {
    Ok(RawReply { status: 200, body: body.to_string() })
  }

  fn status(label: &str) -> Step {
    Step::Reply(ok(json!({"content": {"status": label}})))
  }

  fn broken() -> Step {
    Step::Reply(Err(TransportError("connection reset".into())))
  }

  fn request() -> GenerationRequest {
    GenerationRequest {
      difficulty: Difficulty::Intermediate,
      category: "Learning".into(),
      required_points: 0,
      reward_points: 50,
      auto_create: true,
    }
  }

  fn poller(backend: &Arc<ScriptedBackend>) -> JobPoller<ScriptedBackend> {
    JobPoller::new(backend.clone(), BackoffPolicy::default())
  }

  /// Collect events until the cycle finishes.
  async fn until_finished(rx: &mut broadcast::Receiver<PollEvent>) -> (Vec<PollEvent>, Outcome, bool) {
    let mut seen = Vec::new();
    loop {
      match rx.recv().await.expect("event stream open") {
        PollEvent::Finished { outcome, retry_available } => return (seen, outcome, retry_available),
        other => seen.push(other),
      }
    }
  }

  /// Let every pending timer fire, then report the events emitted meanwhile.
  async fn drain_after_idle(rx: &mut broadcast::Receiver<PollEvent>) -> Vec<PollEvent> {
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
      out.push(ev);
    }
    out
  }

  #[tokio::test(start_paused = true)]
  async fn completes_after_processing_then_completed() {
    let backend = Arc::new(
      ScriptedBackend::default()
        .on_submit(ok(json!({"contentId": "42", "status": "queued"})))
        .on_status(status("processing"))
        .on_status(Step::Reply(ok(json!({"content": {
          "status": "completed", "title": "Learn Rust", "objectives": ["borrow", "own"]
        }})))),
    );
    let p = poller(&backend);
    let mut rx = p.subscribe();

    let job = p.submit(request()).await.expect("accepted");
    assert_eq!(job.id.as_str(), "42");
    assert_eq!(job.status, JobStatus::Queued);

    let (seen, outcome, retry) = until_finished(&mut rx).await;
    assert!(matches!(seen[0], PollEvent::Submitted { .. }));
    let updates: Vec<_> = seen
      .iter()
      .filter_map(|e| match e {
        PollEvent::Update { update } => Some(update.clone()),
        _ => None,
      })
      .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status, JobStatus::Processing);
    assert_eq!(updates[0].attempt_count, 1);

    match outcome {
      Outcome::Succeeded { job, result } => {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(result["title"], "Learn Rust");
        assert_eq!(job.result.as_ref().expect("result")["objectives"][1], "own");
      }
      other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!retry);
    assert_eq!(backend.polls(), 2);

    assert!(drain_after_idle(&mut rx).await.is_empty());
    assert_eq!(backend.polls(), 2);
    let snap = p.snapshot().await;
    assert!(!snap.poll.is_active);
    assert!(!snap.retry_available);
  }

  #[tokio::test(start_paused = true)]
  async fn pending_and_approved_count_as_success() {
    for label in ["pending", "approved"] {
      let backend = Arc::new(ScriptedBackend::default().on_status(status(label)));
      let p = poller(&backend);
      let mut rx = p.subscribe();
      p.submit(request()).await.expect("accepted");
      let (_, outcome, _) = until_finished(&mut rx).await;
      assert!(matches!(outcome, Outcome::Succeeded { .. }), "{label}");
      assert_eq!(backend.polls(), 1);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn submission_error_without_fallback_never_polls() {
    let backend = Arc::new(
      ScriptedBackend::default().on_submit(Ok(RawReply { status: 500, body: json!({"error": "db error"}).to_string() })),
    );
    let p = poller(&backend);
    let mut rx = p.subscribe();

    let err = p.submit(request()).await.expect_err("must fail");
    assert_eq!(err, PollerError::Submission { status: Some(500), message: "db error".into() });

    let events = drain_after_idle(&mut rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], PollEvent::Rejected { .. }));
    assert_eq!(backend.polls(), 0);
    let snap = p.snapshot().await;
    assert!(!snap.poll.is_active);
    assert!(snap.job.is_none());
    assert_eq!(p.retry().await, Err(PollerError::RetryUnavailable));
  }

  #[tokio::test(start_paused = true)]
  async fn transport_failure_on_submit_is_submission_error() {
    let backend = Arc::new(ScriptedBackend::default().on_submit(Err(TransportError("dns failure".into()))));
    let p = poller(&backend);
    let err = p.submit(request()).await.expect_err("must fail");
    assert!(matches!(err, PollerError::Submission { status: None, .. }));
    assert!(!p.snapshot().await.poll.is_active);
  }

  #[tokio::test(start_paused = true)]
  async fn malformed_submission_reply_is_protocol_error() {
    let backend = Arc::new(ScriptedBackend::default().on_submit(Ok(RawReply { status: 200, body: "{}".into() })));
    let p = poller(&backend);
    assert!(matches!(p.submit(request()).await, Err(PollerError::Protocol(_))));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.polls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn times_out_after_attempt_ceiling() {
    let backend = Arc::new(ScriptedBackend::default());
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");

    let (seen, outcome, retry) = until_finished(&mut rx).await;
    assert_eq!(backend.polls(), 40);
    assert!(retry);
    match &outcome {
      Outcome::TimedOut { attempts, job } => {
        assert_eq!(*attempts, 40);
        assert_eq!(job.status, JobStatus::Processing);
      }
      other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(outcome.error(), Some(PollerError::Timeout { attempts: 40 }));
    let updates = seen.iter().filter(|e| matches!(e, PollEvent::Update { .. })).count();
    assert_eq!(updates, 39);

    assert!(drain_after_idle(&mut rx).await.is_empty());
    assert_eq!(backend.polls(), 40);
    assert!(p.snapshot().await.retry_available);
  }

  #[tokio::test(start_paused = true)]
  async fn delays_hold_during_warmup_then_grow_to_cap() {
    let backend = Arc::new(ScriptedBackend::default());
    let p = poller(&backend);
    let mut rx = p.subscribe();
    let started = Instant::now();
    p.submit(request()).await.expect("accepted");
    until_finished(&mut rx).await;

    let times: Vec<Instant> = backend.polled.lock().unwrap().iter().map(|(_, t)| *t).collect();
    assert_eq!(times.len(), 40);
    let first = (times[0] - started).as_millis() as u64;
    assert!((3_000..3_010).contains(&first), "first poll after {first}ms");

    let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_millis() as u64).collect();
    for (i, gap) in gaps.iter().enumerate().take(5) {
      assert!((3_000..3_010).contains(gap), "gap {i} was {gap}ms");
    }
    assert!((4_500..4_510).contains(&gaps[5]), "gap after attempt 6 was {}ms", gaps[5]);
    for w in gaps[5..].windows(2) {
      assert!(w[1] + 5 >= w[0], "{gaps:?}");
    }
    assert!(gaps.iter().all(|g| *g <= 15_010), "{gaps:?}");
  }

  #[tokio::test(start_paused = true)]
  async fn fallback_id_is_polled_with_warning() {
    let backend = Arc::new(
      ScriptedBackend::default()
        .on_submit(Ok(RawReply {
          status: 502,
          body: json!({"fallbackContentId": "f-9", "message": "upstream slow, queued anyway"}).to_string(),
        }))
        .on_status(status("completed")),
    );
    let p = poller(&backend);
    let mut rx = p.subscribe();

    let job = p.submit(request()).await.expect("degraded success");
    assert_eq!(job.id.as_str(), "f-9");

    let (seen, outcome, _) = until_finished(&mut rx).await;
    assert!(seen.iter().any(|e| matches!(
      e,
      PollEvent::Warning { warning: Warning::FallbackId { message, .. } } if message == "upstream slow, queued anyway"
    )));
    assert!(matches!(outcome, Outcome::Succeeded { .. }));
    assert_eq!(backend.polled.lock().unwrap()[0].0, JobId::new("f-9"));
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_after_poll_resolves_stops_all_traffic() {
    let backend = Arc::new(ScriptedBackend::default());
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");

    loop {
      if let PollEvent::Update { .. } = rx.recv().await.expect("event") {
        break;
      }
    }
    p.cancel().await;
    p.cancel().await;

    let events = drain_after_idle(&mut rx).await;
    assert_eq!(events.len(), 1, "{events:?}");
    assert!(matches!(events[0], PollEvent::Cancelled { .. }));
    assert_eq!(backend.polls(), 1);

    let snap = p.snapshot().await;
    assert!(!snap.poll.is_active);
    assert_eq!(snap.poll.attempt_count, 0);
    assert_eq!(snap.job.expect("last job kept").status, JobStatus::Processing);
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_with_poll_in_flight_discards_the_reply() {
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(
      ScriptedBackend::default().on_status(Step::Gated(gate.clone(), ok(json!({"content": {"status": "completed"}})))),
    );
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");

    while backend.polls() == 0 {
      tokio::time::sleep(Duration::from_millis(500)).await;
    }
    p.cancel().await;
    gate.notify_one();

    let events = drain_after_idle(&mut rx).await;
    assert!(events.iter().all(|e| !matches!(e, PollEvent::Finished { .. } | PollEvent::Update { .. })), "{events:?}");
    assert_eq!(backend.polls(), 1);
    assert_eq!(p.snapshot().await.job.expect("job").status, JobStatus::Queued);
  }

  #[tokio::test(start_paused = true)]
  async fn new_submission_invalidates_running_cycle() {
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(
      ScriptedBackend::default()
        .on_submit(ok(json!({"contentId": "old"})))
        .on_submit(ok(json!({"contentId": "new"})))
        .on_status(Step::Gated(gate.clone(), ok(json!({"content": {"status": "failed", "error": "stale"}}))))
        .on_status(status("completed")),
    );
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("first");
    while backend.polls() == 0 {
      tokio::time::sleep(Duration::from_millis(500)).await;
    }

    p.submit(request()).await.expect("second");
    gate.notify_one();

    let (_, outcome, _) = until_finished(&mut rx).await;
    assert_eq!(outcome.job().id.as_str(), "new");
    assert!(matches!(outcome, Outcome::Succeeded { .. }));
    let ids: Vec<String> = backend.polled.lock().unwrap().iter().map(|(id, _)| id.to_string()).collect();
    assert_eq!(ids, vec!["old", "new"]);
    assert!(drain_after_idle(&mut rx).await.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn five_transport_failures_are_absorbed() {
    let mut b = ScriptedBackend::default();
    for _ in 0..5 {
      b = b.on_status(broken());
    }
    let backend = Arc::new(b.on_status(status("completed")));
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");

    let (seen, outcome, _) = until_finished(&mut rx).await;
    let warnings = seen
      .iter()
      .filter(|e| matches!(e, PollEvent::Warning { warning: Warning::TransientFailure { .. } }))
      .count();
    assert_eq!(warnings, 5);
    assert!(matches!(outcome, Outcome::Succeeded { .. }));
    assert_eq!(backend.polls(), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn sixth_consecutive_failure_is_terminal() {
    let mut b = ScriptedBackend::default();
    for _ in 0..6 {
      b = b.on_status(broken());
    }
    let backend = Arc::new(b);
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");

    let (_, outcome, retry) = until_finished(&mut rx).await;
    match outcome {
      Outcome::Failed { error: PollerError::Communication { failures, .. }, .. } => assert_eq!(failures, 6),
      other => panic!("unexpected outcome {other:?}"),
    }
    assert!(retry);
    assert!(drain_after_idle(&mut rx).await.is_empty());
    assert_eq!(backend.polls(), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn success_resets_failure_streak() {
    let backend = Arc::new(
      ScriptedBackend::default()
        .on_status(broken())
        .on_status(broken())
        .on_status(broken())
        .on_status(status("processing"))
        .on_status(broken())
        .on_status(broken())
        .on_status(broken())
        .on_status(Step::Reply(Ok(RawReply { status: 503, body: "busy".into() })))
        .on_status(status("approved")),
    );
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");
    let (_, outcome, _) = until_finished(&mut rx).await;
    assert!(matches!(outcome, Outcome::Succeeded { .. }));
    assert_eq!(backend.polls(), 9);
  }

  #[tokio::test(start_paused = true)]
  async fn failed_ticks_keep_delay_and_emit_no_update() {
    let backend = Arc::new(
      ScriptedBackend::default()
        .on_status(broken())
        .on_status(broken())
        .on_status(broken())
        .on_status(status("completed")),
    );
    // No warm-up: any growth would show on the second gap.
    let p = JobPoller::new(backend.clone(), BackoffPolicy { warmup_attempts: 0, ..BackoffPolicy::default() });
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");

    let (seen, outcome, _) = until_finished(&mut rx).await;
    assert!(matches!(outcome, Outcome::Succeeded { .. }));
    assert!(seen.iter().all(|e| !matches!(e, PollEvent::Update { .. })), "{seen:?}");

    let times: Vec<Instant> = backend.polled.lock().unwrap().iter().map(|(_, t)| *t).collect();
    assert_eq!(times.len(), 4);
    for w in times.windows(2) {
      let gap = (w[1] - w[0]).as_millis() as u64;
      assert!((3_000..3_010).contains(&gap), "gap was {gap}ms");
    }
  }

  #[tokio::test(start_paused = true)]
  async fn error_field_fails_job_and_enables_retry() {
    let backend = Arc::new(
      ScriptedBackend::default()
        .on_submit(ok(json!({"contentId": 5})))
        .on_status(Step::Reply(ok(json!({"content": {"status": "processing", "error": "prompt rejected"}}))))
        .on_submit(ok(json!({"contentId": 6})))
        .on_status(status("completed")),
    );
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");

    let (_, outcome, retry) = until_finished(&mut rx).await;
    match &outcome {
      Outcome::Failed { job, error } => {
        assert_eq!(error, &PollerError::JobFailure("prompt rejected".into()));
        assert_eq!(job.error_detail.as_deref(), Some("prompt rejected"));
      }
      other => panic!("unexpected outcome {other:?}"),
    }
    assert!(retry);

    let job = p.retry().await.expect("retried");
    assert_eq!(job.id.as_str(), "6");
    let (_, outcome, _) = until_finished(&mut rx).await;
    assert!(matches!(outcome, Outcome::Succeeded { .. }));
    assert_eq!(backend.submits.load(Ordering::SeqCst), 2);
    assert_eq!(p.retry().await, Err(PollerError::RetryUnavailable));
  }

  #[tokio::test(start_paused = true)]
  async fn retry_after_timeout_starts_fresh_cycle() {
    let backend = Arc::new(ScriptedBackend::default());
    let p = poller(&backend);
    let mut rx = p.subscribe();
    p.submit(request()).await.expect("accepted");
    until_finished(&mut rx).await;

    backend.status_steps.lock().unwrap().push_back(status("completed"));
    p.retry().await.expect("retried");
    let snap = p.snapshot().await;
    assert!(snap.poll.is_active);
    assert_eq!(snap.poll.attempt_count, 0);
    assert_eq!(snap.poll.current_delay_ms, 3_000);
    assert!(!snap.retry_available);

    let (_, outcome, _) = until_finished(&mut rx).await;
    assert!(matches!(outcome, Outcome::Succeeded { .. }));
    assert_eq!(backend.polls(), 41);
  }

  #[test]
  fn events_serialize_for_the_ui() {
    let job = Job::new(JobId::new("1"), JobStatus::Failed);
    let ev = PollEvent::Finished {
      outcome: Outcome::Failed { job, error: PollerError::JobFailure("nope".into()) },
      retry_available: true,
    };
    let v = serde_json::to_value(&ev).expect("json");
    assert_eq!(v["kind"], "finished");
    assert_eq!(v["outcome"]["status"], "failed");
    assert_eq!(v["outcome"]["error"], "job failed: nope");
    assert_eq!(v["retry_available"], true);
  }
}
