//! In-memory audit journal with real-time broadcast.
//!
//! Tunnel lifecycle, terminal sessions and file operations are recorded in a
//! fixed-size ring buffer and broadcast to subscribers as they happen.
//!
//! ## Design
//!
//! - **Ring buffer**: `VecDeque<ActivityEntry>` capped at `max_entries` (default 200).
//!   Old entries are silently dropped when the buffer is full.
//! - **Monotonic IDs**: Each entry gets a unique, always-increasing `id` so clients
//!   can request "everything since ID N" without gaps.
//! - **Fire-and-forget**: [`AuditSink::record`] never fails and never awaits, so
//!   protocol code can call it from anywhere without stalling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Types of activities tracked by the journal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    TunnelConnect,
    TunnelServicesChanged,
    TunnelDisconnect,
    TunnelPortConflict,
    TunnelAllocationFailed,
    TunnelKicked,
    TunnelTokenRotated,
    TunnelPortsReleased,
    TerminalOpened,
    TerminalClosed,
    FileList,
    FileStat,
    FileRead,
    FileWrite,
    FileChmod,
    FileChown,
    FileSymlink,
    FileCopy,
    FileRename,
    FileDelete,
    Power,
}

impl ActivityType {
    /// Parse from the serde rename value (e.g. `"tunnel_connect"`, `"file_read"`).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

/// Where the activity originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    Tunnel,
    Ws,
    Rest,
}

/// A single activity journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: u64,
    pub timestamp: u64,
    pub activity_type: ActivityType,
    pub source: ActivitySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// An event handed to an [`AuditSink`]; the sink assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub activity_type: ActivityType,
    pub source: ActivitySource,
    pub server_id: Option<String>,
    pub summary: String,
    pub detail: Option<Value>,
}

impl AuditEvent {
    pub fn new(activity_type: ActivityType, source: ActivitySource, summary: impl Into<String>) -> Self {
        Self {
            activity_type,
            source,
            server_id: None,
            summary: summary.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Best-effort audit trail. Implementations must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// In-memory ring buffer of activity entries with broadcast support.
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    next_id: AtomicU64,
    max_entries: usize,
    broadcast_tx: broadcast::Sender<Value>,
}

impl ActivityLog {
    /// Create a new activity log that broadcasts via the given channel.
    pub fn new(max_entries: usize, broadcast_tx: broadcast::Sender<Value>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries)),
            next_id: AtomicU64::new(1),
            max_entries,
            broadcast_tx,
        }
    }

    /// Append an entry, broadcast it, and return the assigned ID.
    pub fn log(&self, event: AuditEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timestamp = now_ms();

        let entry = ActivityEntry {
            id,
            timestamp,
            activity_type: event.activity_type,
            source: event.source,
            server_id: event.server_id,
            summary: event.summary,
            detail: event.detail,
        };

        let _ = self.broadcast_tx.send(json!({
            "type": "activity.new",
            "entry": &entry,
        }));

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);

        id
    }

    /// Read entries with `id > since_id`, up to `limit`, with optional filters.
    pub fn read_since(
        &self,
        since_id: u64,
        limit: usize,
        activity_type: Option<ActivityType>,
        server_id: Option<&str>,
    ) -> Vec<ActivityEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.id > since_id)
            .filter(|e| activity_type.map_or(true, |t| e.activity_type == t))
            .filter(|e| server_id.map_or(true, |sid| e.server_id.as_deref() == Some(sid)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.broadcast_tx.subscribe()
    }
}

impl AuditSink for ActivityLog {
    fn record(&self, event: AuditEvent) {
        self.log(event);
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    ms
}

/// Truncate a string to `max` chars, appending "..." if truncated.
///
/// Collapses newlines and extra whitespace into single spaces for clean display.
pub fn truncate_str(s: &str, max: usize) -> String {
    let cleaned: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let char_count = cleaned.chars().count();
    if char_count <= max {
        cleaned
    } else {
        let mut result = cleaned
            .chars()
            .take(max.saturating_sub(3))
            .collect::<String>();
        result.push_str("...");
        result
    }
}
