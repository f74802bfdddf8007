//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health`: liveness check.
///
/// Returns uptime, version, and counts of live tunnels, terminals and
/// configured servers. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let tunnels = state.broker.registry().len().await;
    let terminals = state.terminals.count().await;
    let (range_start, range_end) = state.broker.pool().range();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "servers": state.store.count(),
        "tunnels": tunnels,
        "terminals": terminals,
        "tunnel_broker": {
            "enabled": state.config.tunnel.enabled,
            "port_range": [range_start, range_end],
            "mapped_ports": state.broker.pool().mapped_count(),
        },
    }))
}
