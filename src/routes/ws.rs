//! WebSocket upgrade + session loop. Each connection owns one `JobPoller`:
//! client messages drive it, and every poller event is forwarded as JSON.
//! Closing the socket cancels any running poll cycle.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::JobBackend;
use crate::error::PollerError;
use crate::poller::JobPoller;
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::state::AppState;

#[instrument(level = "info", skip(ws, state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "questgen_relay", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

fn encode(msg: &ServerWsMessage) -> String {
  serde_json::to_string(msg).unwrap_or_else(|e| {
    serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e), "retryable": false }).to_string()
  })
}

#[instrument(level = "info", skip_all, fields(session = %Uuid::new_v4()))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "questgen_relay", "WebSocket connected");
  let poller = state.new_poller();
  let mut events = poller.subscribe();
  // Submission or retry still waiting on the backend.
  let mut pending: Option<JoinHandle<()>> = None;

  loop {
    let outgoing = tokio::select! {
      incoming = socket.recv() => match incoming {
        Some(Ok(Message::Text(txt))) => match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(msg) => {
            debug!(target: "questgen_relay", "WS received: {:?}", &msg);
            handle_client_ws(msg, &poller, &mut pending).await
          }
          Err(e) => Some(ServerWsMessage::Error { message: format!("Invalid JSON: {}", e), retryable: false }),
        },
        Some(Ok(Message::Ping(payload))) => {
          let _ = socket.send(Message::Pong(payload)).await;
          None
        }
        Some(Ok(Message::Close(_))) | None => break,
        Some(Ok(_)) => None,
        Some(Err(e)) => {
          warn!(target: "questgen_relay", error = %e, "WS receive error");
          break;
        }
      },
      event = events.recv() => match event {
        Ok(event) => Some(ServerWsMessage::Event { event }),
        Err(RecvError::Lagged(skipped)) => {
          warn!(target: "questgen_relay", skipped, "WS session lagging behind poller events");
          None
        }
        Err(RecvError::Closed) => break,
      },
    };

    if let Some(msg) = outgoing {
      if let Err(e) = socket.send(Message::Text(encode(&msg))).await {
        error!(target: "questgen_relay", error = %e, "WS send error");
        break;
      }
    }
  }

  stop(&poller, &mut pending).await;
  info!(target: "questgen_relay", "WebSocket disconnected");
}

/// Abort a submission that has not reached the poller yet, then cancel polling.
async fn stop<B: JobBackend>(poller: &JobPoller<B>, pending: &mut Option<JoinHandle<()>>) {
  if let Some(task) = pending.take() {
    task.abort();
  }
  poller.cancel().await;
}

fn error_message(e: &PollerError) -> ServerWsMessage {
  ServerWsMessage::Error { message: e.to_string(), retryable: e.is_retryable() }
}

/// React to one client message. Submissions run on their own task so the
/// session keeps forwarding events (and can cancel) while the backend answers.
/// That task is kept in `pending` so a cancel can still stop it.
#[instrument(level = "info", skip(poller, pending))]
async fn handle_client_ws<B: JobBackend>(
  msg: ClientWsMessage,
  poller: &JobPoller<B>,
  pending: &mut Option<JoinHandle<()>>,
) -> Option<ServerWsMessage> {
  match msg {
    ClientWsMessage::Ping => Some(ServerWsMessage::Pong),

    ClientWsMessage::Generate(request) => {
      let p = poller.clone();
      if let Some(prev) = pending.take() {
        prev.abort();
      }
      *pending = Some(tokio::spawn(async move {
        // Rejections reach the client as a `rejected` event.
        if let Err(e) = p.submit(request).await {
          debug!(target: "questgen_relay", error = %e, "WS generate did not start polling");
        }
      }));
      None
    }

    ClientWsMessage::Cancel => {
      stop(poller, pending).await;
      None
    }

    ClientWsMessage::Retry => {
      if !poller.snapshot().await.retry_available {
        return Some(error_message(&PollerError::RetryUnavailable));
      }
      let p = poller.clone();
      if let Some(prev) = pending.take() {
        prev.abort();
      }
      *pending = Some(tokio::spawn(async move {
        if let Err(e) = p.retry().await {
          warn!(target: "questgen_relay", error = %e, "WS retry failed");
        }
      }));
      None
    }
  }
}
