//! # WebSocket Handlers
//!
//! Entry point for agents:
//! - Upgrading HTTP connections to WebSocket
//! - Running the registration handshake (`Register` → `RegisterAck`)
//! - Handing the connection to its [`Session`] until it closes
//! - Removing the session from the registry afterwards

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{future, stream::SplitSink, SinkExt, Stream, StreamExt, TryStreamExt};
use tracing::{info, warn};
use tunnel_protocol::Envelope;
use uuid::Uuid;

use crate::session::Session;
use crate::state::AppState;

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /ws`: upgrades the HTTP connection to a WebSocket connection.
///
/// After the upgrade, the connection is handled by [`handle_connection`].
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of a single agent connection.
///
/// ## Flow:
/// 1. Wait (bounded by the registration timeout) for `Register`
/// 2. Register the tunnel; refuse the connection if that fails
/// 3. Run the session: it writes `RegisterAck` first, then relays requests
/// 4. On disconnect: remove the session from the registry
async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New connection: {}", conn_id);

    let (mut ws_sink, ws_stream) = socket.split();
    let mut frames = text_frames(ws_stream);

    // ── Registration Handshake ──
    let first = tokio::time::timeout(state.config.register_timeout(), frames.next()).await;
    let tunnel_id = match first {
        Ok(Some(Ok(text))) => match Envelope::decode(&text) {
            Ok(Envelope::Register { tunnel_id }) => tunnel_id,
            Ok(other) => {
                warn!(conn_id = %conn_id, kind = other.kind(), "expected register as first message");
                refuse(&mut ws_sink, close_code::POLICY, "expected register").await;
                return;
            }
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "malformed registration");
                refuse(&mut ws_sink, close_code::POLICY, "malformed registration").await;
                return;
            }
        },
        Ok(Some(Err(e))) => {
            warn!(conn_id = %conn_id, error = %e, "read failed before registration");
            return;
        }
        Ok(None) => {
            info!(conn_id = %conn_id, "connection closed before registration");
            return;
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "registration timed out");
            refuse(&mut ws_sink, close_code::POLICY, "registration timed out").await;
            return;
        }
    };

    let session = match state.registry.register(&tunnel_id) {
        Ok(session) => session,
        Err(e) => {
            warn!(conn_id = %conn_id, tunnel_id = %tunnel_id, error = %e, "registration refused");
            refuse(&mut ws_sink, close_code::AGAIN, &e.to_string()).await;
            return;
        }
    };
    info!(conn_id = %conn_id, tunnel_id = %tunnel_id, "agent registered");

    // ── Session ──
    // The session's writer owns the sink from here on.
    let sink = ws_sink.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });
    Arc::clone(&session).run(sink, frames).await;

    // ── Cleanup on Disconnect ──
    state.registry.remove(&session);
    info!("Disconnecting: {}", conn_id);
}

/// Envelope text carried by each data frame. Control frames are skipped;
/// axum answers pings on its own.
fn text_frames<S>(stream: S) -> impl Stream<Item = Result<String, axum::Error>> + Unpin + Send
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    stream.try_filter_map(|msg| {
        future::ready(Ok(match msg {
            Message::Text(text) => Some(text.as_str().to_owned()),
            Message::Binary(data) => Some(String::from_utf8_lossy(&data).into_owned()),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
        }))
    })
}

async fn refuse(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
