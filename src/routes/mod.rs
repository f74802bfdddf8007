//! HTTP route handlers and the router that ties them together.
//!
//! Every handler except [`health`] sits behind
//! [`crate::auth::require_api_key`]; the WebSocket upgrades in [`crate::ws`] check
//! `?token=` themselves. Errors are `(StatusCode, Json)` pairs with an
//! `error` message and an UPPER_SNAKE `code`.

pub mod activity;
pub mod files;
pub mod health;
pub mod power;
pub mod terminals;
pub mod tunnels;

use std::fmt::Display;

use axum::{
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::connector::ConnectError;
use crate::resolve::ResolveError;
use crate::sftp::SftpError;
use crate::state::AppState;
use crate::tunnel::broker::BrokerError;
use crate::ws;

pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl Display, code: &str) -> ApiError {
    (status, Json(json!({ "error": message.to_string(), "code": code })))
}

pub fn resolve_error(e: &ResolveError) -> ApiError {
    let status = match e {
        ResolveError::UnknownServer(_) => StatusCode::NOT_FOUND,
        ResolveError::TunnelOffline(_) | ResolveError::MissingService { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ResolveError::NoSsh(_) => StatusCode::BAD_REQUEST,
        ResolveError::Decrypt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e, e.code())
}

pub fn connect_error(e: &ConnectError) -> ApiError {
    let status = match e {
        ConnectError::Timeout { .. } | ConnectError::CommandTimeout => StatusCode::GATEWAY_TIMEOUT,
        ConnectError::UnsupportedAuth(_) | ConnectError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        ConnectError::Decrypt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    };
    api_error(status, e, e.code())
}

pub fn sftp_error(e: &SftpError) -> ApiError {
    if let SftpError::Connect(inner) = e {
        return connect_error(inner);
    }
    let status = match e.code() {
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "PERMISSION_DENIED" => StatusCode::FORBIDDEN,
        "INVALID_PATH" | "IS_DIRECTORY" | "FILE_TOO_LARGE" | "UNKNOWN_USER" | "UNKNOWN_GROUP" => {
            StatusCode::BAD_REQUEST
        }
        "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    api_error(status, e, e.code())
}

pub fn broker_error(e: &BrokerError) -> ApiError {
    let (status, code) = match e {
        BrokerError::UnknownServer(_) => (StatusCode::NOT_FOUND, "SERVER_NOT_FOUND"),
        BrokerError::NotTunnel(_) => (StatusCode::BAD_REQUEST, "NOT_A_TUNNEL"),
        BrokerError::TunnelOnline(_) => (StatusCode::CONFLICT, "TUNNEL_ONLINE"),
    };
    api_error(status, e, code)
}

/// The full API: public health, authenticated REST, and the WebSocket
/// upgrades.
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/api/health", get(health::health));

    let sftp_limit = GlobalConcurrencyLimitLayer::with_semaphore(state.sftp_permits.clone());
    let file_routes = Router::new()
        .route(
            "/api/servers/{id}/files",
            get(files::get_files)
                .put(files::put_file)
                .delete(files::delete_file),
        )
        .route("/api/servers/{id}/files/chmod", post(files::chmod))
        .route("/api/servers/{id}/files/chown", post(files::chown))
        .route("/api/servers/{id}/files/symlink", post(files::symlink))
        .route("/api/servers/{id}/files/rename", post(files::rename))
        .route("/api/servers/{id}/files/copy", post(files::copy))
        .layer(sftp_limit);

    let authed = Router::new()
        .route("/api/activity", get(activity::get_activity))
        .route("/api/tunnels", get(tunnels::list_tunnels))
        .route("/api/tunnels/{server_id}", delete(tunnels::kick))
        .route("/api/tunnels/{server_id}/rotate", post(tunnels::rotate))
        .route("/api/tunnels/{server_id}/ports", delete(tunnels::release_ports))
        .route("/api/terminals", get(terminals::list_terminals))
        .route("/api/terminals/{session_id}", delete(terminals::close_terminal))
        .route("/api/servers/{id}/power", post(power::power))
        .merge(file_routes)
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/api/servers/{id}/terminal", get(ws::terminal))
        .route(
            "/api/servers/{id}/containers/{container}/exec",
            get(ws::container_exec),
        );

    Router::new()
        .merge(public)
        .merge(authed)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PrivateKey};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::state::AppState;

    pub const KEY: &str = "test-key";

    /// State with the given `[[servers]]` TOML and a test API key.
    pub fn state_with(servers_toml: &str) -> AppState {
        let mut config = Config::parse(servers_toml).unwrap();
        config.auth.api_key = KEY.to_string();
        config.server.connect_timeout_ms = 500;
        config.server.command_timeout_ms = 500;
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        AppState::new(config, key).unwrap()
    }

    pub async fn send(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {KEY}"));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = super::router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}
