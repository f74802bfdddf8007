//! Full-duplex relay between a [`TerminalSession`] and a WebSocket.
//!
//! ## Framing
//!
//! | Direction | Frame | Meaning |
//! |-----------|-------|---------|
//! | server → client | binary | terminal output, at most [`CHUNK_SIZE`] bytes |
//! | server → client | binary `0x00` + JSON | control (`{"type":"error","code","message"}`) |
//! | client → server | binary | raw stdin, forwarded verbatim |
//! | client → server | binary `0x00` + JSON, or text | control (`{"type":"resize","rows","cols"}`) |
//!
//! Malformed control frames, unknown control types and resizes with a zero
//! dimension are dropped silently; one bad frame never ends a session.
//!
//! ## Lifecycle
//!
//! Two pumps run concurrently until either side fails or the registry entry
//! is force-closed. The first to stop fires a shared token, the other winds
//! down even when parked on a send or write, and teardown (close session, close socket, unregister, audit) runs
//! once, after both have returned.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::activity::{ActivitySource, ActivityType, AuditEvent, AuditSink};
use crate::connector::TerminalSession;
use crate::sessions::{TerminalEntry, TerminalKind, TerminalRegistry};

/// Largest binary frame sent to the client.
pub const CHUNK_SIZE: usize = 4096;
/// First byte of a binary control frame.
pub const CONTROL_SENTINEL: u8 = 0x00;
const SOCKET_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Who the relay belongs to and where it reports.
pub struct RelayContext {
    pub session_id: String,
    pub server_id: String,
    pub kind: TerminalKind,
    pub terminals: TerminalRegistry,
    pub audit: Arc<dyn AuditSink>,
}

/// Totals reported once at teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Client stdin bytes written to the session.
    pub bytes_in: u64,
    /// Session output bytes sent to the client.
    pub bytes_out: u64,
    pub duration_ms: u64,
}

#[derive(Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    rows: i64,
    #[serde(default)]
    cols: i64,
}

/// What an inbound frame asks for.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Close,
    Ignore,
}

/// Resize dimensions from a control payload, if it is a valid resize.
fn parse_control(payload: &[u8]) -> Option<(u16, u16)> {
    let frame: ControlFrame = serde_json::from_slice(payload).ok()?;
    if frame.kind != "resize" {
        return None;
    }
    let rows = u16::try_from(frame.rows).ok().filter(|r| *r > 0)?;
    let cols = u16::try_from(frame.cols).ok().filter(|c| *c > 0)?;
    Some((rows, cols))
}

fn classify(msg: Message) -> Inbound {
    let control = |payload: &[u8]| match parse_control(payload) {
        Some((rows, cols)) => Inbound::Resize { rows, cols },
        None => Inbound::Ignore,
    };
    match msg {
        Message::Text(text) => control(text.as_str().as_bytes()),
        Message::Binary(bytes) => match bytes.split_first() {
            Some((&CONTROL_SENTINEL, rest)) => control(rest),
            Some(_) => Inbound::Data(bytes.to_vec()),
            None => Inbound::Ignore,
        },
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => Inbound::Ignore,
    }
}

/// Binary control frame carrying `value`.
pub fn control_frame(value: &serde_json::Value) -> Message {
    let mut payload = vec![CONTROL_SENTINEL];
    payload.extend_from_slice(value.to_string().as_bytes());
    Message::Binary(payload.into())
}

/// Tell a waiting client why its session never started, then close.
pub async fn send_error_frame<S>(sink: &mut S, code: &str, message: &str)
where
    S: Sink<Message> + Unpin,
{
    let frame = control_frame(&json!({ "type": "error", "code": code, "message": message }));
    let _ = sink.send(frame).await;
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Drive `session` against the socket halves until either side ends.
pub async fn run<S, R, E>(session: TerminalSession, mut sink: S, mut stream: R, ctx: RelayContext) -> RelayStats
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let started = Instant::now();
    let entry = TerminalEntry::new(ctx.session_id.clone(), ctx.server_id.clone(), ctx.kind);
    let forced = entry.cancel_token();
    ctx.terminals.register(entry).await;
    ctx.audit.record(
        AuditEvent::new(ActivityType::TerminalOpened, ActivitySource::Ws, "terminal opened")
            .server(ctx.server_id.clone())
            .detail(json!({ "session_id": ctx.session_id, "kind": ctx.kind })),
    );

    let (mut reader, writer) = session.split();
    let done = CancellationToken::new();

    let output_pump = async {
        let mut bytes_out = 0u64;
        'pump: loop {
            let chunk = tokio::select! {
                () = done.cancelled() => break,
                chunk = reader.read() => chunk,
            };
            let Some(data) = chunk else {
                debug!("Session output ended");
                break;
            };
            for piece in data.chunks(CHUNK_SIZE) {
                let sent = tokio::select! {
                    () = done.cancelled() => break 'pump,
                    sent = sink.send(Message::Binary(piece.to_vec().into())) => sent,
                };
                if sent.is_err() {
                    debug!("Socket closed while sending output");
                    break 'pump;
                }
                bytes_out += piece.len() as u64;
            }
        }
        done.cancel();
        bytes_out
    };

    let input_pump = async {
        let mut bytes_in = 0u64;
        loop {
            let frame = tokio::select! {
                () = done.cancelled() => break,
                frame = stream.next() => frame,
            };
            let msg = match frame {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(error = %e, "Socket read failed");
                    break;
                }
                None => break,
            };
            ctx.terminals.touch(&ctx.session_id).await;
            match classify(msg) {
                Inbound::Data(data) => {
                    let len = data.len() as u64;
                    let written = tokio::select! {
                        () = done.cancelled() => break,
                        written = writer.write(data) => written,
                    };
                    if written.is_err() {
                        debug!("Session closed while writing input");
                        break;
                    }
                    bytes_in += len;
                }
                Inbound::Resize { rows, cols } => {
                    let resized = tokio::select! {
                        () = done.cancelled() => break,
                        resized = writer.resize(rows, cols) => resized,
                    };
                    if resized.is_err() {
                        break;
                    }
                }
                Inbound::Close => break,
                Inbound::Ignore => {}
            }
        }
        done.cancel();
        bytes_in
    };

    let force_watch = async {
        tokio::select! {
            () = forced.cancelled() => {
                debug!("Relay force-closed");
                done.cancel();
            }
            () = done.cancelled() => {}
        }
    };

    let (bytes_out, bytes_in, ()) = tokio::join!(output_pump, input_pump, force_watch);

    writer.close().await;
    // A client that stopped reading must not hold teardown hostage.
    let _ = tokio::time::timeout(SOCKET_CLOSE_GRACE, sink.close()).await;
    ctx.terminals.unregister(&ctx.session_id).await;

    #[allow(clippy::cast_possible_truncation)]
    let stats = RelayStats {
        bytes_in,
        bytes_out,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(bytes_in, bytes_out, duration_ms = stats.duration_ms, "Terminal closed");
    ctx.audit.record(
        AuditEvent::new(ActivityType::TerminalClosed, ActivitySource::Ws, "terminal closed")
            .server(ctx.server_id)
            .detail(json!({
                "session_id": ctx.session_id,
                "kind": ctx.kind,
                "bytes_in": stats.bytes_in,
                "bytes_out": stats.bytes_out,
                "duration_ms": stats.duration_ms,
            })),
    );
    stats
}
