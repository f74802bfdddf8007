//! Turning a resolved target into a live terminal.
//!
//! | Variant | Transport | Session |
//! |---------|-----------|---------|
//! | [`Connector::Ssh`] | russh client, password or private key | PTY shell or PTY + fixed command |
//! | [`Connector::Container`] | bollard exec attach on the local engine | TTY exec |
//!
//! Both variants hand back the same [`TerminalSession`], so the relay never
//! knows which one it is driving. A tunnel target is an ordinary SSH target
//! whose host and port point at the locally forwarded `ssh` service.
//!
//! There is no reconnect-on-drop here. A dropped session ends and the client
//! opens a new one.

pub mod container;
pub mod ssh;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use container::ContainerConnector;
pub use ssh::{run_command, CommandOutput, SshConnector};

use crate::store::DecryptError;

/// Capacity of the per-session input and output queues.
const SESSION_QUEUE: usize = 64;

/// Everything needed to open one connection. Built per request from a server
/// record and its decrypted credential; never persisted or echoed back.
#[derive(Clone, Default)]
pub struct ConnectorConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// `password` or `key`.
    pub auth_type: String,
    /// Plaintext password or PEM private key.
    pub secret: String,
    pub passphrase: Option<String>,
    pub shell: Option<String>,
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth_type", &self.auth_type)
            .field("secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("shell", &self.shell)
            .finish()
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot reach {host}:{port}: {source}")]
    Unreachable {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {host}:{port} after {secs}s")]
    Timeout { host: String, port: u16, secs: u64 },
    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },
    #[error("unsupported auth type {0:?}")]
    UnsupportedAuth(String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("credential decrypt failed: {0}")]
    Decrypt(#[from] DecryptError),
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),
    #[error("container engine: {0}")]
    Container(#[from] bollard::errors::Error),
    #[error("exec started detached")]
    Detached,
    #[error("remote command timed out")]
    CommandTimeout,
}

impl ConnectError {
    /// Transport errors that are the normal result of a command that takes
    /// the remote end down (reboot, shutdown). Distinct from a target that
    /// was never reachable.
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            ConnectError::CommandTimeout => true,
            ConnectError::Ssh(e) => is_closed_transport(e),
            _ => false,
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::Unreachable { .. } => "UNREACHABLE",
            ConnectError::Timeout { .. } => "CONNECT_TIMEOUT",
            ConnectError::AuthFailed { .. } => "AUTH_FAILED",
            ConnectError::UnsupportedAuth(_) => "UNSUPPORTED_AUTH",
            ConnectError::InvalidKey(_) => "INVALID_KEY",
            ConnectError::Decrypt(_) => "DECRYPT_FAILED",
            ConnectError::Ssh(_) => "SSH_ERROR",
            ConnectError::Container(_) | ConnectError::Detached => "CONTAINER_ERROR",
            ConnectError::CommandTimeout => "COMMAND_TIMEOUT",
        }
    }
}

fn is_closed_transport(e: &russh::Error) -> bool {
    match e {
        russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => true,
        russh::Error::IO(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// Closed set of ways to open a terminal.
#[derive(Debug, Clone)]
pub enum Connector {
    Ssh(SshConnector),
    Container(ContainerConnector),
}

impl Connector {
    /// Open a session. `timeout` bounds dial, handshake and authentication.
    pub async fn connect(
        &self,
        config: &ConnectorConfig,
        size: TermSize,
        timeout: Duration,
    ) -> Result<TerminalSession, ConnectError> {
        match self {
            Connector::Ssh(c) => c.connect(config, size, timeout).await,
            Connector::Container(c) => c.connect(size, timeout).await,
        }
    }
}

/// Input accepted by a session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Close,
}

/// The session is gone; nothing more can be written.
#[derive(Debug, Error)]
#[error("terminal session closed")]
pub struct SessionClosed;

/// A live PTY or exec session driven by a background task.
///
/// Output ends (`read` returns `None`) when the remote side closes.
pub struct TerminalSession {
    input: mpsc::Sender<SessionInput>,
    output: mpsc::Receiver<Vec<u8>>,
    driver: Option<JoinHandle<()>>,
}

impl TerminalSession {
    /// Wire a session out of raw queues. The caller owns whatever services
    /// the other ends.
    pub fn from_parts(input: mpsc::Sender<SessionInput>, output: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            input,
            output,
            driver: None,
        }
    }

    /// Spawn `driver` with fresh queues and return the session for it.
    pub(crate) fn spawn<F, Fut>(driver: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<SessionInput>, mpsc::Sender<Vec<u8>>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (input_tx, input_rx) = mpsc::channel(SESSION_QUEUE);
        let (output_tx, output_rx) = mpsc::channel(SESSION_QUEUE);
        let handle = tokio::spawn(driver(input_rx, output_tx));
        Self {
            input: input_tx,
            output: output_rx,
            driver: Some(handle),
        }
    }

    pub fn split(self) -> (SessionReader, SessionWriter) {
        (
            SessionReader {
                output: self.output,
            },
            SessionWriter {
                input: self.input,
                driver: self.driver,
            },
        )
    }
}

/// Read half of a [`TerminalSession`].
pub struct SessionReader {
    output: mpsc::Receiver<Vec<u8>>,
}

impl SessionReader {
    /// Next chunk of output, or `None` once the session has ended.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }
}

/// Write half of a [`TerminalSession`].
pub struct SessionWriter {
    input: mpsc::Sender<SessionInput>,
    driver: Option<JoinHandle<()>>,
}

impl SessionWriter {
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SessionClosed> {
        self.input
            .send(SessionInput::Data(data))
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionClosed> {
        self.input
            .send(SessionInput::Resize { rows, cols })
            .await
            .map_err(|_| SessionClosed)
    }

    /// Ask the driver to close the remote side and wait briefly for it.
    ///
    /// Never blocks on a full input queue; a driver that is not draining it
    /// is aborted once the grace period runs out.
    pub async fn close(mut self) {
        let _ = self.input.try_send(SessionInput::Close);
        if let Some(driver) = self.driver.take() {
            let abort = driver.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), driver).await.is_err() {
                abort.abort();
            }
        }
    }
}

/// Quote `s` for a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | '+' | ','));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
