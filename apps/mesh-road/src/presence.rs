use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use mesh_protocol::{RoomId, ServerMessage};
use metrics::counter;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::handlers::{authenticate, ApiError};
use crate::registry::Subscription;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    /// Browsers cannot set headers on a websocket upgrade.
    token: Option<String>,
}

/// Upgrades to a presence stream after authenticating and subscribing, so
/// failures surface as plain HTTP errors rather than a dead socket.
pub async fn presence_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<PresenceQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let subscription = match open_subscription(&state, room_id, &headers, query.token.as_deref())
    {
        Ok(subscription) => subscription,
        Err(err) => return err.into_response(),
    };
    let send_timeout = state.send_timeout;
    ws.on_upgrade(move |socket| forward_presence(socket, subscription, send_timeout))
        .into_response()
}

fn open_subscription(
    state: &AppState,
    room_id: String,
    headers: &HeaderMap,
    token: Option<&str>,
) -> Result<Subscription, ApiError> {
    let identity = authenticate(state, headers, token)?;
    let room_id = RoomId::parse(room_id)?;
    Ok(state.registry.subscribe(&room_id, &identity)?)
}

const LAGGED_REASON: &str = "presence stream lagged";

/// An error frame the client can log, then the close that ends the stream.
fn lagged_frames() -> Vec<Message> {
    let error = ServerMessage::Error {
        message: LAGGED_REASON.into(),
    };
    let mut frames = Vec::with_capacity(2);
    if let Ok(payload) = serde_json::to_string(&error) {
        frames.push(Message::Text(payload));
    }
    frames.push(Message::Close(Some(CloseFrame {
        code: close_code::AGAIN,
        reason: LAGGED_REASON.into(),
    })));
    frames
}

async fn forward_presence(socket: WebSocket, mut subscription: Subscription, send_timeout: Duration) {
    let (mut sender, mut receiver) = socket.split();
    let room_id = subscription.room_id().clone();
    let subscriber = subscription.id();
    info!(room = %room_id, subscriber, "presence stream opened");
    counter!("mesh_road_presence_streams_total", 1);

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else {
                    // Dropped from fan-out; closing makes the client
                    // resubscribe and start over from a fresh snapshot.
                    warn!(room = %room_id, subscriber, "presence stream lagged");
                    for frame in lagged_frames() {
                        if !matches!(timeout(send_timeout, sender.send(frame)).await, Ok(Ok(()))) {
                            break;
                        }
                    }
                    break;
                };
                let payload = match serde_json::to_string(&message) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(room = %room_id, subscriber, error = %err, "failed to encode presence frame");
                        continue;
                    }
                };
                match timeout(send_timeout, sender.send(Message::Text(payload))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(room = %room_id, subscriber, error = %err, "presence socket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(room = %room_id, subscriber, "presence socket write timed out");
                        counter!("mesh_road_subscribers_dropped_total", 1, "reason" => "send_timeout");
                        break;
                    }
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(room = %room_id, subscriber, error = %err, "presence socket read failed");
                    break;
                }
            },
        }
    }

    // Unsubscribe only. Membership is untouched until an explicit leave or
    // the liveness sweep.
    drop(subscription);
    let _ = timeout(send_timeout, sender.close()).await;
    info!(room = %room_id, subscriber, "presence stream closed");
}
