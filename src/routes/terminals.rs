//! Live terminal sessions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::{api_error, ApiError};
use crate::state::AppState;

/// `GET /api/terminals`
pub async fn list_terminals(State(state): State<AppState>) -> Json<Value> {
    let terminals = state.terminals.list().await;
    Json(json!({ "terminals": terminals }))
}

/// `DELETE /api/terminals/{session_id}`: force-close. The relay tears itself
/// down and unregisters; this only signals it.
pub async fn close_terminal(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.terminals.disconnect(&session_id).await {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no terminal session {session_id}"),
            "SESSION_NOT_FOUND",
        ));
    }
    Ok(Json(json!({ "session_id": session_id, "closing": true })))
}
