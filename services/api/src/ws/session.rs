//! Manages the Twilio WebSocket connection lifecycle for one phone call.

use super::{
    provider::deepgram,
    telephony::{self},
    transport::{TelephonySink, TelephonyStream},
};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Axum handler to upgrade the Twilio media stream request to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Runs one call from accept to teardown.
///
/// Connects the voice agent first; if that fails, Twilio gets an error event
/// and the socket is closed. Otherwise both legs are handed to the session
/// bridge and this task waits until the bridge reports the session closed.
#[instrument(name = "call", skip_all, fields(session_id, stream_sid))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New Twilio media stream connection");
    let config = &state.config;
    let (source, mut sink) = telephony::split(
        socket,
        config.audio_chunk_bytes,
        config.caller_vad_threshold,
        config.max_audio_skips,
    );

    let agent =
        match deepgram::connect(&config.agent_url, &config.deepgram_api_key, &state.agent_settings)
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                error!(error = ?e, "Could not connect to the voice agent");
                if let Err(e) = sink.send_error("WEBSOCKET_ERROR", &e.to_string()).await {
                    error!(error = %e, "Failed to report the error to Twilio");
                }
                sink.close().await;
                return;
            }
        };

    let handle = state.bridge.open(
        TelephonyStream {
            source: Box::new(source),
            sink: Box::new(sink),
        },
        agent,
    );
    tracing::Span::current().record("session_id", handle.id().to_string());
    state.sessions.insert(handle.clone()).await;

    handle.closed().await;
    state.sessions.remove(handle.id()).await;
    info!(
        reason = %handle.close_reason().map(|r| r.to_string()).unwrap_or_default(),
        "Call finished"
    );
}
