//! API handlers

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use errors::LineError;

use super::AppState;
use crate::ems::EmsStats;
use crate::transport::{ConnectionManager, ConnectionState, ConnectionStats};
use crate::workflow::{Stage, WorkflowStatus};

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PeerStatus {
    pub address: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub stats: ConnectionStats,
}

impl PeerStatus {
    fn of(connection: &ConnectionManager) -> Self {
        Self {
            address: connection.address(),
            state: connection.state(),
            connected: connection.is_connected(),
            stats: connection.stats(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EmsStatus {
    pub url: String,
    pub stats: EmsStats,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub workflow: WorkflowStatus,
    pub plc: PeerStatus,
    pub upper_computer: PeerStatus,
    pub ems: EmsStatus,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub accepted: bool,
    pub stage: Stage,
    pub device_id: Option<String>,
}

/// @route GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// @route GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<ServiceStatus> {
    let service = &state.service;
    Json(ServiceStatus {
        workflow: service.orchestrator().status(),
        plc: PeerStatus::of(service.plc().connection()),
        upper_computer: PeerStatus::of(service.upper().connection()),
        ems: EmsStatus {
            url: service.ems().url().to_string(),
            stats: service.ems().stats(),
        },
    })
}

/// Start a cycle; the body is optional
///
/// @route POST /api/workflow/start
/// @input `{"device_id": "..."}` or empty
/// @output 200 when a cycle was opened, 409 when the current stage refuses it
pub async fn start_workflow(State(state): State<AppState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice::<StartRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                let error = LineError::InvalidOperation(format!("invalid start request: {}", e));
                return (StatusCode::BAD_REQUEST, Json(error.to_error_info())).into_response();
            },
        }
    };

    let orchestrator = state.service.orchestrator();
    let accepted = orchestrator.start(request.device_id).await;
    info!("Operator start request {}", if accepted { "accepted" } else { "refused" });
    command_response(accepted, orchestrator.status())
}

/// @route POST /api/workflow/reset
pub async fn reset_workflow(State(state): State<AppState>) -> Response {
    let orchestrator = state.service.orchestrator();
    let applied = orchestrator.reset().await;
    info!("Operator reset ({})", if applied { "applied" } else { "already idle" });
    // Reset in IDLE is a valid no-op, not a conflict
    let status = orchestrator.status();
    (
        StatusCode::OK,
        Json(CommandResponse {
            accepted: applied,
            stage: status.stage,
            device_id: status.device_id,
        }),
    )
        .into_response()
}

fn command_response(accepted: bool, status: WorkflowStatus) -> Response {
    let code = if accepted {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (
        code,
        Json(CommandResponse {
            accepted,
            stage: status.stage,
            device_id: status.device_id,
        }),
    )
        .into_response()
}
