//! `POST /api/servers/{id}/power`: reboot or shut down a server over SSH.
//!
//! The command usually takes the connection down with it, so a transport
//! error after the command was sent, or the command deadline expiring, both
//! count as success.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{api_error, connect_error, resolve_error, ApiError};
use crate::activity::{ActivitySource, ActivityType, AuditEvent, AuditSink};
use crate::connector::run_command;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PowerRequest {
    /// `reboot` or `shutdown`.
    pub action: String,
}

fn command_for(action: &str) -> Option<&'static str> {
    match action {
        "reboot" => Some("reboot"),
        "shutdown" => Some("shutdown -h now"),
        _ => None,
    }
}

pub async fn power(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(req): Json<PowerRequest>,
) -> Result<Json<Value>, ApiError> {
    let Some(command) = command_for(&req.action) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("unknown power action {:?}", req.action),
            "INVALID_ACTION",
        ));
    };
    let config = state
        .resolver
        .resolve(&server_id)
        .await
        .and_then(|t| t.into_ssh())
        .map_err(|e| resolve_error(&e))?;

    match run_command(&config, command, state.connect_timeout(), state.command_timeout()).await {
        Ok(out) if out.exit_status.is_some_and(|s| s != 0) => {
            warn!(server_id = %server_id, action = %req.action, exit_status = ?out.exit_status, "Power command failed");
            Err(api_error(
                StatusCode::BAD_GATEWAY,
                format!("{command} exited with {:?}: {}", out.exit_status, out.output.trim()),
                "COMMAND_FAILED",
            ))
        }
        Ok(_) => Ok(sent(&state, &server_id, &req.action)),
        Err(e) if e.is_expected_disconnect() => {
            info!(server_id = %server_id, error = %e, "Connection dropped after power command");
            Ok(sent(&state, &server_id, &req.action))
        }
        Err(e) => Err(connect_error(&e)),
    }
}

fn sent(state: &AppState, server_id: &str, action: &str) -> Json<Value> {
    info!(server_id = %server_id, action = %action, "Power command sent");
    state.activity_log.record(
        AuditEvent::new(ActivityType::Power, ActivitySource::Rest, action.to_string()).server(server_id),
    );
    Json(json!({ "status": "sent", "action": action }))
}
