//! Remote file operations over SFTP.
//!
//! | Method | Path | Body / query |
//! |--------|------|--------------|
//! | GET | `/api/servers/{id}/files` | `path`, `op=list\|stat\|read` |
//! | PUT | `/api/servers/{id}/files` | `path`, `content`, `encoding`, `mode` |
//! | DELETE | `/api/servers/{id}/files` | `path`, `recursive` |
//! | POST | `/api/servers/{id}/files/chmod` | `path`, `mode`, `recursive` |
//! | POST | `/api/servers/{id}/files/chown` | `path`, `user`, `group` |
//! | POST | `/api/servers/{id}/files/symlink` | `target`, `link` |
//! | POST | `/api/servers/{id}/files/rename` | `from`, `to` |
//! | POST | `/api/servers/{id}/files/copy` | `from`, `to`; progress as SSE |
//!
//! Every request opens its own SSH connection. Reads return UTF-8 text, or
//! base64 with `"encoding": "base64"` when the file is not valid UTF-8.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use base64::Engine;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{api_error, resolve_error, sftp_error, ApiError};
use crate::activity::{truncate_str, ActivitySource, ActivityType, AuditEvent};
use crate::connector::ConnectorConfig;
use crate::sftp::{self, SftpError};
use crate::state::AppState;

/// Progress events buffered per copy before intermediate ones are dropped.
const COPY_EVENT_QUEUE: usize = 32;

async fn ssh_config(state: &AppState, server_id: &str) -> Result<ConnectorConfig, ApiError> {
    state
        .resolver
        .resolve(server_id)
        .await
        .and_then(|t| t.into_ssh())
        .map_err(|e| resolve_error(&e))
}

fn audit(state: &AppState, activity_type: ActivityType, server_id: &str, path: &str, detail: Option<Value>) {
    let mut event =
        AuditEvent::new(activity_type, ActivitySource::Rest, truncate_str(path, 80)).server(server_id);
    if let Some(detail) = detail {
        event = event.detail(detail);
    }
    state.activity_log.log(event);
}

/// Parse an octal mode string such as `"0644"` or `"755"`.
fn parse_mode(mode: &str) -> Result<u32, ApiError> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                format!("Invalid octal mode: {mode:?}"),
                "INVALID_MODE",
            )
        })
}

/// Query parameters for `GET /api/servers/{id}/files`.
#[derive(Deserialize)]
pub struct FilesQuery {
    pub path: String,
    /// `list`, `stat` or `read`. Defaults to `list` for paths ending in `/`
    /// and `read` otherwise.
    pub op: Option<String>,
}

pub async fn get_files(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Value>, ApiError> {
    let op = query
        .op
        .as_deref()
        .unwrap_or(if query.path.ends_with('/') { "list" } else { "read" });
    if !matches!(op, "list" | "stat" | "read") {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("unknown op {op:?}"),
            "INVALID_OP",
        ));
    }
    let config = ssh_config(&state, &server_id).await?;
    let opts = state.sftp_options();
    let path = query.path.as_str();

    match op {
        "list" => {
            let entries = sftp::list(&config, opts, path).await.map_err(|e| sftp_error(&e))?;
            audit(&state, ActivityType::FileList, &server_id, path, None);
            Ok(Json(json!({ "path": path, "entries": entries })))
        }
        "stat" => {
            let entry = sftp::stat(&config, opts, path).await.map_err(|e| sftp_error(&e))?;
            audit(&state, ActivityType::FileStat, &server_id, path, None);
            Ok(Json(json!(entry)))
        }
        _ => {
            let file = sftp::read(&config, opts, path).await.map_err(|e| sftp_error(&e))?;
            audit(&state, ActivityType::FileRead, &server_id, path, None);
            let size = file.data.len();
            Ok(Json(match String::from_utf8(file.data) {
                Ok(text) => json!({ "path": file.path, "size": size, "content": text }),
                Err(e) => json!({
                    "path": file.path,
                    "size": size,
                    "content": base64::engine::general_purpose::STANDARD.encode(e.as_bytes()),
                    "encoding": "base64",
                }),
            }))
        }
    }
}

/// Request body for `PUT /api/servers/{id}/files`.
#[derive(Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    /// UTF-8 text, or base64 when `encoding` is `"base64"`.
    pub content: String,
    pub encoding: Option<String>,
    /// Octal permission string, e.g. `"0644"`.
    pub mode: Option<String>,
}

pub async fn put_file(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(req): Json<FileWriteRequest>,
) -> Result<Json<Value>, ApiError> {
    let data = match req.encoding.as_deref() {
        Some("base64") => base64::engine::general_purpose::STANDARD
            .decode(&req.content)
            .map_err(|e| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid base64: {e}"),
                    "INVALID_CONTENT",
                )
            })?,
        None | Some("utf8" | "utf-8") => req.content.into_bytes(),
        Some(other) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown encoding {other:?}"),
                "INVALID_CONTENT",
            ))
        }
    };
    let mode = req.mode.as_deref().map(parse_mode).transpose()?;
    let config = ssh_config(&state, &server_id).await?;

    let written = sftp::write(&config, state.sftp_options(), &req.path, &data, mode)
        .await
        .map_err(|e| sftp_error(&e))?;
    audit(
        &state,
        ActivityType::FileWrite,
        &server_id,
        &req.path,
        Some(json!({ "size": written, "mode": req.mode })),
    );
    Ok(Json(json!({ "path": req.path, "bytes_written": written })))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    let config = ssh_config(&state, &server_id).await?;
    let removed = sftp::delete(&config, state.sftp_options(), &query.path, query.recursive)
        .await
        .map_err(|e| sftp_error(&e))?;
    audit(
        &state,
        ActivityType::FileDelete,
        &server_id,
        &query.path,
        Some(json!({ "removed": removed, "recursive": query.recursive })),
    );
    Ok(Json(json!({ "path": query.path, "removed": removed })))
}

#[derive(Deserialize)]
pub struct ChmodRequest {
    pub path: String,
    pub mode: String,
    #[serde(default)]
    pub recursive: bool,
}

pub async fn chmod(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(req): Json<ChmodRequest>,
) -> Result<Json<Value>, ApiError> {
    let mode = parse_mode(&req.mode)?;
    let config = ssh_config(&state, &server_id).await?;
    let opts = state.sftp_options();
    let changed = if req.recursive {
        sftp::chmod_recursive(&config, opts, &req.path, mode).await
    } else {
        sftp::chmod(&config, opts, &req.path, mode).await.map(|()| 1)
    }
    .map_err(|e| sftp_error(&e))?;
    audit(
        &state,
        ActivityType::FileChmod,
        &server_id,
        &req.path,
        Some(json!({ "mode": req.mode, "recursive": req.recursive, "changed": changed })),
    );
    Ok(Json(json!({ "path": req.path, "mode": format!("{mode:04o}"), "changed": changed })))
}

#[derive(Deserialize)]
pub struct ChownRequest {
    pub path: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

pub async fn chown(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(req): Json<ChownRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.user.is_none() && req.group.is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "one of user or group is required",
            "INVALID_OWNER",
        ));
    }
    let config = ssh_config(&state, &server_id).await?;
    let (uid, gid) = sftp::chown(
        &config,
        state.sftp_options(),
        &req.path,
        req.user.as_deref(),
        req.group.as_deref(),
    )
    .await
    .map_err(|e| sftp_error(&e))?;
    audit(
        &state,
        ActivityType::FileChown,
        &server_id,
        &req.path,
        Some(json!({ "user": req.user, "group": req.group, "uid": uid, "gid": gid })),
    );
    Ok(Json(json!({ "path": req.path, "uid": uid, "gid": gid })))
}

#[derive(Deserialize)]
pub struct SymlinkRequest {
    /// What the link points at; may be relative.
    pub target: String,
    /// Absolute path of the link to create.
    pub link: String,
}

pub async fn symlink(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(req): Json<SymlinkRequest>,
) -> Result<Json<Value>, ApiError> {
    let config = ssh_config(&state, &server_id).await?;
    sftp::symlink(&config, state.sftp_options(), &req.target, &req.link)
        .await
        .map_err(|e| sftp_error(&e))?;
    audit(
        &state,
        ActivityType::FileSymlink,
        &server_id,
        &req.link,
        Some(json!({ "target": req.target })),
    );
    Ok(Json(json!({ "link": req.link, "target": req.target })))
}

#[derive(Deserialize)]
pub struct MoveRequest {
    pub from: String,
    pub to: String,
}

pub async fn rename(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<Value>, ApiError> {
    let config = ssh_config(&state, &server_id).await?;
    sftp::rename(&config, state.sftp_options(), &req.from, &req.to)
        .await
        .map_err(|e| sftp_error(&e))?;
    audit(
        &state,
        ActivityType::FileRename,
        &server_id,
        &req.from,
        Some(json!({ "to": req.to })),
    );
    Ok(Json(json!({ "from": req.from, "to": req.to })))
}

/// One SSE event of a copy.
#[derive(Debug)]
enum CopyEvent {
    Progress { copied: u64, total: u64 },
    Done { copied: u64, total: u64 },
    Failed { copied: u64, total: u64, code: &'static str, error: String },
}

impl CopyEvent {
    fn into_sse(self) -> Event {
        let (name, data) = match self {
            CopyEvent::Progress { copied, total } => ("progress", json!({ "copied": copied, "total": total })),
            CopyEvent::Done { copied, total } => ("done", json!({ "copied": copied, "total": total })),
            CopyEvent::Failed {
                copied,
                total,
                code,
                error,
            } => (
                "error",
                json!({ "copied": copied, "total": total, "code": code, "error": error }),
            ),
        };
        Event::default().event(name).data(data.to_string())
    }
}

/// `POST /api/servers/{id}/files/copy`: streams `progress` events, then one
/// `done` or `error` carrying the final progress.
///
/// The copy runs in its own task and finishes even if the client goes away.
pub async fn copy(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(req): Json<MoveRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let config = ssh_config(&state, &server_id).await?;
    let (tx, rx) = mpsc::channel::<CopyEvent>(COPY_EVENT_QUEUE);

    tokio::spawn(async move {
        // The route-level limit releases once the response starts streaming.
        let _permit = state.sftp_permits.clone().acquire_owned().await;
        let mut last = (0u64, 0u64);
        let mut progress = |copied: u64, total: u64| {
            last = (copied, total);
            // Intermediate progress is dropped when the client lags.
            let _ = tx.try_send(CopyEvent::Progress { copied, total });
        };
        let result = sftp::copy(&config, state.sftp_options(), &req.from, &req.to, &mut progress).await;

        let final_event = match result {
            Ok(copied) => {
                info!(server_id = %server_id, from = %req.from, to = %req.to, bytes = copied, "File copied");
                audit(
                    &state,
                    ActivityType::FileCopy,
                    &server_id,
                    &req.from,
                    Some(json!({ "to": req.to, "bytes": copied })),
                );
                CopyEvent::Done {
                    copied,
                    total: last.1.max(copied),
                }
            }
            Err(e) => {
                let (copied, total) = match &e {
                    SftpError::CopyInterrupted { copied, total, .. } => (*copied, *total),
                    _ => last,
                };
                debug!(server_id = %server_id, error = %e, "Copy failed");
                CopyEvent::Failed {
                    copied,
                    total,
                    code: e.code(),
                    error: e.to_string(),
                }
            }
        };
        let _ = tx.send(final_event).await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event.into_sse()), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::routes::router;
    use crate::routes::test_support::{send, state_with, KEY};

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn unreachable_state() -> AppState {
        state_with(&format!(
            r#"
            [[servers]]
            id = "web-01"
            host = "127.0.0.1"
            port = {}
            user = "root"
            secret = "cGFzcw=="

            [[servers]]
            id = "local"
            connect_type = "local"
            "#,
            closed_port()
        ))
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0o4755").unwrap(), 0o4755);
        assert!(parse_mode("999").is_err());
        assert!(parse_mode("77777").is_err());
    }

    #[tokio::test]
    async fn test_request_validation_precedes_connecting() {
        let state = unreachable_state();
        let (status, body) = send(&state, "GET", "/api/servers/web-01/files?path=/etc&op=tail", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_OP");

        let (status, body) = send(&state, "GET", "/api/servers/web-01/files?path=etc/hosts", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_PATH");

        let bad_b64 = json!({ "path": "/tmp/x", "content": "!!!", "encoding": "base64" });
        let (status, body) = send(&state, "PUT", "/api/servers/web-01/files", Some(bad_b64)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_CONTENT");

        let bad_mode = json!({ "path": "/tmp/x", "mode": "rwx" });
        let (status, body) = send(&state, "POST", "/api/servers/web-01/files/chmod", Some(bad_mode)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_MODE");

        let (status, body) = send(&state, "POST", "/api/servers/web-01/files/chown", Some(json!({ "path": "/tmp/x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_OWNER");
    }

    #[tokio::test]
    async fn test_unreachable_and_local_targets() {
        let state = unreachable_state();
        let (status, body) = send(&state, "GET", "/api/servers/web-01/files?path=/etc/", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "UNREACHABLE");

        let (status, body) = send(&state, "DELETE", "/api/servers/local/files?path=/tmp/x", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "NO_SSH_ENDPOINT");
    }

    #[tokio::test]
    async fn test_copy_failure_arrives_as_error_event() {
        let state = unreachable_state();
        let request = Request::builder()
            .method("POST")
            .uri("/api/servers/web-01/files/copy")
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({ "from": "/a", "to": "/b" }).to_string()))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: error"), "{text}");
        assert!(text.contains("UNREACHABLE"), "{text}");
        assert!(!text.contains("event: done"));
    }
}
