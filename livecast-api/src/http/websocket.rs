//! WebSocket signaling endpoint
//!
//! The handshake is checked before the upgrade so rejected peers get a plain
//! HTTP status. A request that passes the handshake but cannot be upgraded
//! gives its seat back. After the upgrade one task writes replies and room
//! events to the socket while the connection task reads requests and handles
//! them in order.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use livecast_core::credentials::strip_bearer;
use livecast_core::models::{Role, RoomRef};
use livecast_sfu::{Admission, Handshake};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::http::{AppError, AppResult, AppState};
use crate::signaling::protocol::{ProtocolError, UNKNOWN_REQUEST_ID};
use crate::signaling::{ServerFrame, SignalingSession};

/// Query parameters of the upgrade request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingQuery {
    #[serde(default)]
    pub role: Role,
    pub token: Option<String>,
    #[serde(alias = "liveId")]
    pub room_id: Option<String>,
    pub slug: Option<String>,
}

impl SignalingQuery {
    /// Build the handshake; the query token wins over the `Authorization` header
    #[must_use]
    pub fn into_handshake(self, header_token: Option<&str>) -> Handshake {
        let room = match (self.room_id, self.slug) {
            (Some(id), _) if !id.is_empty() => Some(RoomRef::Id(id.into())),
            (_, Some(slug)) if !slug.is_empty() => Some(RoomRef::Slug(slug)),
            _ => None,
        };
        let token = self
            .token
            .map(|t| strip_bearer(&t).to_string())
            .or_else(|| header_token.map(|t| strip_bearer(t).to_string()))
            .filter(|t| !t.is_empty());

        Handshake {
            role: self.role,
            token,
            room,
        }
    }
}

/// WebSocket handler for signaling
///
/// `ws://host/ws?role=broadcaster&token=<jwt>&slug=<slug>`
pub async fn signaling_handler(
    State(state): State<AppState>,
    Query(query): Query<SignalingQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<impl IntoResponse> {
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let handshake = query.into_handshake(header_token);

    if handshake.role == Role::Broadcaster {
        let token = handshake
            .token
            .as_deref()
            .ok_or_else(|| AppError::unauthorized("Missing token"))?;
        state
            .signaling
            .gate
            .verify(token)
            .map_err(|e| AppError::unauthorized(e.to_string()))?;
    }

    let admission = state.signaling.gate.admit(handshake).await?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            state.signaling.gate.release(&admission);
            return Err(AppError::new(rejection.status(), rejection.body_text()));
        }
    };
    let max_message_bytes = state.config.server.max_message_bytes;

    Ok(ws
        .max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, admission)))
}

async fn handle_socket(socket: WebSocket, state: AppState, admission: Admission) {
    let span = info_span!(
        "signaling",
        peer_id = %admission.peer_id,
        room_id = admission.room.as_ref().map_or("", |live| live.id.as_str()),
        role = %admission.role,
    );
    run_connection(socket, state, admission).instrument(span).await;
}

async fn run_connection(socket: WebSocket, state: AppState, admission: Admission) {
    let (mut session, mut events) =
        match SignalingSession::open(Arc::clone(&state.signaling), admission).await {
            Ok(opened) => opened,
            Err(err) => {
                warn!(error = %err, "Failed to open signaling session");
                return;
            }
        };
    info!(host = session.is_host(), "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) =
        mpsc::channel::<ServerFrame>(state.config.server.outbound_buffer.max(1));

    let mut writer = tokio::spawn(
        async move {
            loop {
                let frame = tokio::select! {
                    Some(frame) = reply_rx.recv() => frame,
                    event = events.recv() => match event {
                        Some(event) => ServerFrame::Event(event),
                        // Dropped by the notifier: the peer fell behind on events
                        None => {
                            warn!("Event queue dropped, closing connection");
                            if let Err(e) = sink.close().await {
                                debug!(error = %e, "Failed to close WebSocket");
                            }
                            break;
                        }
                    },
                };
                if let Err(e) = sink.send(Message::Text(frame.encode().into())).await {
                    debug!(error = %e, "Failed to send WebSocket message");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = &mut writer => break,
        };
        let Some(message) = message else {
            break;
        };
        let reply = match message {
            Ok(Message::Text(text)) => session.handle(text.as_str()).await,
            Ok(Message::Binary(_)) => ServerFrame::protocol_error(
                UNKNOWN_REQUEST_ID,
                &ProtocolError::Invalid("binary frames are not supported".to_string()),
            ),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "WebSocket receive error");
                break;
            }
        };
        if reply_tx.send(reply).await.is_err() {
            break;
        }
    }

    session.close();
    writer.abort();
    info!("WebSocket connection closed");
}
