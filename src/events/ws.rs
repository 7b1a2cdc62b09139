//! WebSocket push channel for lifecycle events.
//!
//! Data frames are JSON `BoardEvent`s; keep-alive frames are the literal
//! text [`KEEP_ALIVE_MARKER`].

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use super::bus::EventBus;
use crate::board::model::EventFilter;

/// Text frame sent when there is nothing else to say.
pub const KEEP_ALIVE_MARKER: &str = "keep-alive";

#[derive(Clone)]
struct StreamState {
    bus: Arc<EventBus>,
    keepalive: Duration,
}

/// Build the router serving `/ws/events`.
pub fn event_routes(bus: Arc<EventBus>, keepalive: Duration) -> Router {
    Router::new()
        .route("/ws/events", get(ws_handler))
        .with_state(StreamState { bus, keepalive })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<EventFilter>,
    State(state): State<StreamState>,
) -> impl IntoResponse {
    info!(?filter, "Event stream client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn handle_socket(mut socket: WebSocket, state: StreamState, filter: EventFilter) {
    let mut subscription = state.bus.subscribe(filter);
    let mut keepalive = interval_at(Instant::now() + state.keepalive, state.keepalive);

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!("Event bus closed");
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                }
            }

            _ = keepalive.tick() => {
                if socket.send(Message::Text(KEEP_ALIVE_MARKER.into())).await.is_err() {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    // The stream is push-only; client text is ignored.
                    _ => {}
                }
            }
        }
    }

    debug!("Event stream connection closed");
}
