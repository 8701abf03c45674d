//! Quest generation relay.
//!
//! The core is [`poller::JobPoller`]: it submits a quest generation request to
//! the backend, polls the job with a growing delay, classifies the backend's
//! status labels and reports progress and the final outcome as events. The
//! rest of the crate wires it to a small axum server that streams those events
//! to a UI over WebSocket.

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod routes;
pub mod schedule;
pub mod state;
pub mod telemetry;
pub mod util;

pub use backend::{HttpBackend, JobBackend, RawReply, TransportError};
pub use domain::{Difficulty, GenerationRequest, Job, JobId, JobStatus};
pub use error::PollerError;
pub use poller::{JobPoller, JobStatusUpdate, Outcome, PollEvent, PollSnapshot, Warning};
pub use schedule::{BackoffPolicy, PollState};
