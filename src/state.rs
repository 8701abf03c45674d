//! Application state shared by the HTTP and WebSocket handlers.
//!
//! Holds the relay config and one backend client. Pollers are not shared:
//! every WebSocket session builds its own on top of the same backend.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::backend::{HttpBackend, JobBackend, TransportError};
use crate::config::RelayConfig;
use crate::poller::JobPoller;

pub struct AppState<B: JobBackend = HttpBackend> {
    pub config: RelayConfig,
    pub backend: Arc<B>,
}

impl AppState<HttpBackend> {
    /// Build state from config: construct the reqwest-backed client.
    #[instrument(level = "info", skip_all, fields(backend_url = %config.backend_url))]
    pub fn new(config: RelayConfig) -> Result<Self, TransportError> {
        let backend = HttpBackend::new(&config.backend_url, config.submit_timeout(), config.poll_timeout())?;
        info!(
            target: "questgen_relay",
            base_url = %backend.base_url,
            submit_timeout_secs = config.submit_timeout_secs,
            poll_timeout_secs = config.poll_timeout_secs,
            max_attempts = config.backoff.max_attempts,
            "Backend client ready"
        );
        Ok(Self { config, backend: Arc::new(backend) })
    }
}

impl<B: JobBackend> AppState<B> {
    /// A fresh poller bound to this state's backend and schedule.
    pub fn new_poller(&self) -> JobPoller<B> {
        JobPoller::new(self.backend.clone(), self.config.backoff.clone())
    }
}
