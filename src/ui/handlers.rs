//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{DeliveryError, TransportError};
use crate::session::{ConnectionState, SessionInfo};
use crate::tracks::{BridgeStatus, Track};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Relay status
#[derive(Serialize)]
pub struct SystemStatus {
    pub state: ConnectionState,
    pub session: Option<SessionInfo>,
    pub bridge_count: usize,
    pub local_track_count: usize,
    /// Why the session closed, when it was not a local disconnect
    pub terminal_error: Option<String>,
    pub uptime_seconds: u64,
}

/// Get relay status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let manager = &state.manager;
    let status = SystemStatus {
        state: manager.state(),
        session: manager.session_info(),
        bridge_count: manager.bridge_count(),
        local_track_count: manager.local_tracks().len(),
        terminal_error: manager.terminal_error().map(|e| e.to_string()),
        uptime_seconds: state.started.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

/// Get all bridges
pub async fn get_bridges(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<BridgeStatus>>> {
    Json(ApiResponse::ok(state.manager.bridges()))
}

#[derive(Serialize)]
pub struct TrackListing {
    pub local: Vec<Track>,
    pub remote: Vec<Track>,
}

/// Get local publications and known remote tracks
pub async fn get_tracks(State(state): State<Arc<AppState>>) -> Json<ApiResponse<TrackListing>> {
    Json(ApiResponse::ok(TrackListing {
        local: state.manager.local_tracks(),
        remote: state.manager.remote_tracks(),
    }))
}

#[derive(Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    /// Defaults to the configured processing participant
    #[serde(default)]
    pub destination: Option<String>,
}

/// Send a prompt over the control channel
pub async fn send_prompt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PromptRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let destination = req.destination.as_deref().unwrap_or(&state.prompt_target);

    match state.manager.control().send_prompt(destination, &req.prompt).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => {
            let status = match e {
                DeliveryError::NotConnected(_) => StatusCode::CONFLICT,
                DeliveryError::Transport(TransportError::UnknownParticipant(_)) => StatusCode::NOT_FOUND,
                DeliveryError::Encode(_) => StatusCode::BAD_REQUEST,
                DeliveryError::Transport(_) => StatusCode::BAD_GATEWAY,
            };
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// Leave the session
pub async fn disconnect(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ConnectionState>> {
    state.manager.disconnect().await;
    Json(ApiResponse::ok(state.manager.state()))
}
