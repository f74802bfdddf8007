//! WebSocket upgrades for interactive terminals.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects with `?token=<api_key>`; the token is checked before
//!    the upgrade completes.
//! 2. After the upgrade the server is resolved and the connector dialed. A
//!    failure here sends one control frame and closes:
//!    `0x00 {"type":"error","code":"UNREACHABLE","message":"..."}`.
//! 3. Otherwise the socket is handed to [`crate::relay::run`]: binary frames
//!    are stdin, binary frames back are stdout in chunks of at most 4096
//!    bytes, and text frames or `0x00`-prefixed binary frames are JSON
//!    control (`resize`). A WebSocket close frame ends the session.
//!
//! | Path | Connector |
//! |------|-----------|
//! | `/api/servers/{id}/terminal` | SSH login shell (direct or through the tunnel) |
//! | `/api/servers/{id}/containers/{container}/exec` | local engine exec, or `docker exec` over SSH |

use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::auth::token_matches;
use crate::connector::{ConnectError, Connector, ConnectorConfig, ContainerConnector, SshConnector, TermSize};
use crate::relay::{self, RelayContext};
use crate::resolve::{ResolveError, Target};
use crate::routes::api_error;
use crate::sessions::TerminalKind;
use crate::state::AppState;

/// Query parameters for the terminal upgrades.
#[derive(Deserialize)]
pub struct TerminalQuery {
    pub token: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    /// Container exec only; falls back to the server's shell, then the
    /// configured default.
    pub shell: Option<String>,
}

impl TerminalQuery {
    fn size(&self, state: &AppState) -> TermSize {
        let server = &state.config.server;
        TermSize {
            rows: self.rows.filter(|r| *r > 0).unwrap_or(server.default_rows),
            cols: self.cols.filter(|c| *c > 0).unwrap_or(server.default_cols),
        }
    }
}

/// Why a session never started.
struct OpenError {
    code: &'static str,
    message: String,
}

impl From<ResolveError> for OpenError {
    fn from(e: ResolveError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<ConnectError> for OpenError {
    fn from(e: ConnectError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

fn unauthorized() -> Response {
    api_error(StatusCode::UNAUTHORIZED, "Invalid or missing token", "UNAUTHORIZED").into_response()
}

/// `GET /api/servers/{id}/terminal?token=&rows=&cols=`
pub async fn terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    if !token_matches(&state.config.auth.api_key, query.token.as_deref()) {
        return unauthorized();
    }
    let size = query.size(&state);
    ws.on_upgrade(move |socket| serve(socket, state, server_id, None, size))
}

/// `GET /api/servers/{id}/containers/{container}/exec?token=&shell=&rows=&cols=`
pub async fn container_exec(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((server_id, container)): Path<(String, String)>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    if !token_matches(&state.config.auth.api_key, query.token.as_deref()) {
        return unauthorized();
    }
    let size = query.size(&state);
    let exec = ContainerRequest {
        container,
        shell: query.shell,
    };
    ws.on_upgrade(move |socket| serve(socket, state, server_id, Some(exec), size))
}

struct ContainerRequest {
    container: String,
    shell: Option<String>,
}

/// Pick the connector for a resolved target.
fn plan(
    state: &AppState,
    target: Target,
    exec: Option<ContainerRequest>,
) -> Result<(Connector, ConnectorConfig, TerminalKind), OpenError> {
    let default_shell = &state.config.server.default_shell;
    match (target, exec) {
        (Target::Ssh(config), None) => Ok((Connector::Ssh(SshConnector::shell()), config, TerminalKind::Ssh)),
        (Target::Ssh(config), Some(exec)) => {
            let shell = exec.shell.or_else(|| config.shell.clone()).unwrap_or_else(|| default_shell.clone());
            Ok((
                Connector::Ssh(SshConnector::container(&exec.container, &shell)),
                config,
                TerminalKind::Container,
            ))
        }
        (Target::Local { shell, .. }, Some(exec)) => {
            let shell = exec.shell.or(shell).unwrap_or_else(|| default_shell.clone());
            Ok((
                Connector::Container(ContainerConnector::new(exec.container, shell)),
                ConnectorConfig::default(),
                TerminalKind::Container,
            ))
        }
        (Target::Local { server_id, .. }, None) => Err(ResolveError::NoSsh(server_id).into()),
    }
}

async fn serve(socket: WebSocket, state: AppState, server_id: String, exec: Option<ContainerRequest>, size: TermSize) {
    let session_id = Uuid::new_v4().to_string();
    let span = info_span!("terminal", session_id = %session_id, server_id = %server_id);
    relay_socket(socket, state, server_id, session_id, exec, size)
        .instrument(span)
        .await;
}

async fn relay_socket(
    socket: WebSocket,
    state: AppState,
    server_id: String,
    session_id: String,
    exec: Option<ContainerRequest>,
    size: TermSize,
) {
    let (mut sink, stream) = socket.split();

    let opened = async {
        let target = state.resolver.resolve(&server_id).await?;
        let (connector, config, kind) = plan(&state, target, exec)?;
        let session = connector.connect(&config, size, state.connect_timeout()).await?;
        Ok::<_, OpenError>((session, kind))
    }
    .await;

    let (session, kind) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            debug!(code = e.code, error = %e.message, "Terminal failed to open");
            relay::send_error_frame(&mut sink, e.code, &e.message).await;
            return;
        }
    };

    let ctx = RelayContext {
        session_id,
        server_id,
        kind,
        terminals: state.terminals.clone(),
        audit: state.activity_log.clone(),
    };
    relay::run(session, sink, stream, ctx).await;
}
