//! Upgrades `/ws` requests and runs one voice session per socket.

use super::connection::WsConnection;
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;
use voxrelay_core::control::ControlService;
use voxrelay_core::tools::{FunctionToolExecutor, ToolRegistry};
use voxrelay_core::{Connection, Session, SessionFlags};

/// Identity of a connecting client, taken from the upgrade request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub session_id: String,
    pub device_id: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Uses `Session-Id` when given, else an ID derived from `Device-Id`, else a
/// random UUID.
pub fn resolve_identity(headers: &HeaderMap) -> ClientIdentity {
    let device_id = header(headers, "device-id");
    let session_id = header(headers, "session-id")
        .or_else(|| {
            device_id
                .as_deref()
                .map(|d| format!("device-{}", d.replace(':', "_")))
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ClientIdentity {
        session_id,
        device_id,
    }
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = resolve_identity(&headers);
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!(
            "voice_session",
            session_id = %identity.session_id,
            device_id = identity.device_id.as_deref().unwrap_or(""),
        );
        handle_socket(socket, state, identity).instrument(span)
    })
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: ClientIdentity) {
    let _active = state.track_session();
    info!(active_sessions = state.active_sessions(), "New WebSocket connection");

    let conn: Arc<dyn Connection> = Arc::new(WsConnection::new(socket));
    let session = match build_session(&state, identity, conn.clone()).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = ?e, "Failed to set up voice session");
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close WebSocket");
            }
            return;
        }
    };

    if let Err(e) = session.handle().await {
        error!(error = %e, "Voice session terminated with error");
    }
    info!("WebSocket connection closed");
}

/// Wires per-session providers and tools into a new [`Session`].
async fn build_session(
    state: &AppState,
    identity: ClientIdentity,
    conn: Arc<dyn Connection>,
) -> Result<Arc<Session>> {
    let providers = state.providers()?;
    let flags = Arc::new(SessionFlags::default());

    let control = ControlService::new(providers.tts.clone(), flags.clone())
        .connect_in_process()
        .await?;
    let mut tools = ToolRegistry::new().with(Arc::new(control));
    if !state.functions.is_empty() {
        tools = tools.with(Arc::new(FunctionToolExecutor::new(
            &state.functions,
            state.llm_factory.as_ref(),
            identity.session_id.clone(),
        )));
    }

    Ok(Session::new(
        identity.session_id,
        identity.device_id,
        conn,
        state.session_config.clone(),
        providers,
        Arc::new(tools),
        flags,
        state.quick_replies.clone(),
    ))
}
