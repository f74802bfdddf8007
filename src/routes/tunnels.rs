//! Tunnel administration.
//!
//! - `GET /api/tunnels`: live sessions
//! - `DELETE /api/tunnels/{server_id}`: kick the live session
//! - `POST /api/tunnels/{server_id}/rotate`: new token, evict the session
//! - `DELETE /api/tunnels/{server_id}/ports`: drop sticky port reservations

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::{api_error, broker_error, ApiError};
use crate::state::AppState;

pub async fn list_tunnels(State(state): State<AppState>) -> Json<Value> {
    let tunnels = state.broker.registry().list().await;
    Json(json!({ "tunnels": tunnels }))
}

pub async fn kick(State(state): State<AppState>, Path(server_id): Path<String>) -> Result<Json<Value>, ApiError> {
    if !state.broker.kick(&server_id).await {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no live tunnel for {server_id}"),
            "TUNNEL_OFFLINE",
        ));
    }
    Ok(Json(json!({ "server_id": server_id, "kicked": true })))
}

/// The plaintext token is in this response and nowhere else.
pub async fn rotate(State(state): State<AppState>, Path(server_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let token = state
        .broker
        .rotate(state.store.as_ref(), state.secrets.as_ref(), &server_id)
        .await
        .map_err(|e| broker_error(&e))?;
    Ok(Json(json!({ "server_id": server_id, "token": token })))
}

pub async fn release_ports(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let ports = state
        .broker
        .release_ports(&server_id)
        .await
        .map_err(|e| broker_error(&e))?;
    Ok(Json(json!({ "server_id": server_id, "released": ports })))
}
