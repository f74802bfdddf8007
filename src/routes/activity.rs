//! Activity journal endpoint.
//!
//! `GET /api/activity?since=N&limit=N&activity_type=tunnel_connect&server_id=edge-01`
//! returns recent audit entries, oldest first.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::activity::ActivityType;
use crate::state::AppState;

/// Query parameters for `GET /api/activity`.
#[derive(Deserialize)]
pub struct ActivityQuery {
    /// Return entries with `id > since`. Defaults to 0 (everything retained).
    #[serde(default, alias = "since_id")]
    pub since: u64,
    /// Defaults to 50, max 200.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Filter by activity type (e.g. `tunnel_connect`, `file_read`).
    pub activity_type: Option<String>,
    pub server_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

/// `GET /api/activity`
pub async fn get_activity(State(state): State<AppState>, Query(query): Query<ActivityQuery>) -> Json<Value> {
    let limit = query.limit.min(200);
    let activity_type = query
        .activity_type
        .as_deref()
        .and_then(ActivityType::from_str_opt);

    let entries = state
        .activity_log
        .read_since(query.since, limit, activity_type, query.server_id.as_deref());
    Json(json!({ "entries": entries }))
}
