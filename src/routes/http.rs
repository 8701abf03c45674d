//! HTTP endpoint handlers. The job routes forward to the backend unchanged so
//! a browser-side client can reach it through the relay.

use std::sync::Arc;
use axum::{
  extract::{Path, State},
  http::{header::CONTENT_TYPE, StatusCode},
  response::{IntoResponse, Response},
  Json,
};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::backend::{JobBackend, RawReply, TransportError};
use crate::domain::JobId;
use crate::protocol::HealthOut;
use crate::state::AppState;

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

fn relay(result: Result<RawReply, TransportError>) -> Response {
  match result {
    Ok(reply) => {
      let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
      (status, [(CONTENT_TYPE, "application/json")], reply.body).into_response()
    }
    Err(e) => {
      warn!(target: "questgen_relay", error = %e, "Backend unreachable");
      (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response()
    }
  }
}

#[instrument(level = "info", skip(state, body))]
pub async fn http_post_job(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
  let result = state.backend.post_jobs_raw(&body).await;
  if let Ok(reply) = &result {
    info!(target: "questgen_relay", status = reply.status, "Proxied job submission");
  }
  relay(result)
}

#[instrument(level = "info", skip(state), fields(%id))]
pub async fn http_get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
  relay(state.backend.status(&JobId::new(id)).await)
}
