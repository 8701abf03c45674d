//! Quest generation relay
//!
//! - Axum HTTP + WebSocket API
//! - One `JobPoller` per WebSocket session, streaming progress to the UI
//! - Thin proxy of the backend job endpoints
//!
//! Important env variables:
//!   PORT                  : u16 (default 3000)
//!   QUESTGEN_BACKEND_URL  : base URL of the quest backend (default "http://localhost:8080/api")
//!   QUESTGEN_CONFIG_PATH  : path to TOML config (timeouts + poll schedule)
//!   LOG_LEVEL             : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT            : "pretty" (default) or "json"

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use questgen_relay::config::load_config_from_env;
use questgen_relay::routes::build_router;
use questgen_relay::state::AppState;
use questgen_relay::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  let config = load_config_from_env();
  let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

  let state = Arc::new(AppState::new(config)?);
  let app = build_router(state.clone());

  let listener = TcpListener::bind(addr).await?;
  info!(target: "questgen_relay", %addr, backend = %state.backend.base_url, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!(target: "questgen_relay", "Shutdown signal received");
    })
    .await?;
  Ok(())
}
