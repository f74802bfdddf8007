//! Direct SSH connector and one-shot remote commands.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{shell_quote, ConnectError, ConnectorConfig, SessionInput, TermSize, TerminalSession};

const TERM: &str = "xterm-256color";

/// Client handler for outbound connections.
///
/// Host keys are accepted unchecked: targets are operator-registered and a
/// tunnel target is always reached over loopback.
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub type ClientHandle = client::Handle<ClientHandler>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMethod {
    Password,
    Key,
}

impl AuthMethod {
    fn parse(s: &str) -> Result<Self, ConnectError> {
        match s {
            "password" => Ok(AuthMethod::Password),
            "key" => Ok(AuthMethod::Key),
            other => Err(ConnectError::UnsupportedAuth(other.to_string())),
        }
    }
}

/// Dial, handshake and authenticate, all within `timeout`.
pub async fn connect_client(config: &ConnectorConfig, timeout: Duration) -> Result<ClientHandle, ConnectError> {
    let method = AuthMethod::parse(&config.auth_type)?;
    tokio::time::timeout(timeout, establish(config, method))
        .await
        .map_err(|_| ConnectError::Timeout {
            host: config.host.clone(),
            port: config.port,
            secs: timeout.as_secs(),
        })?
}

async fn establish(config: &ConnectorConfig, method: AuthMethod) -> Result<ClientHandle, ConnectError> {
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|source| ConnectError::Unreachable {
            host: config.host.clone(),
            port: config.port,
            source,
        })?;
    let _ = stream.set_nodelay(true);

    let ssh_config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    });
    let mut handle = client::connect_stream(ssh_config, stream, ClientHandler).await?;

    let result = match method {
        AuthMethod::Password => {
            handle
                .authenticate_password(config.user.clone(), config.secret.clone())
                .await
        }
        AuthMethod::Key => {
            let key = russh::keys::decode_secret_key(&config.secret, config.passphrase.as_deref())
                .map_err(|e| ConnectError::InvalidKey(e.to_string()))?;
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(config.user.clone(), PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await
        }
    };

    let auth_failed = || ConnectError::AuthFailed {
        user: config.user.clone(),
        host: config.host.clone(),
    };
    match result {
        Ok(AuthResult::Success) => Ok(handle),
        Ok(AuthResult::Failure { .. }) => Err(auth_failed()),
        // Servers that drop the connection on a bad credential.
        Err(_) if handle.is_closed() => Err(auth_failed()),
        Err(e) => Err(e.into()),
    }
}

/// PTY-backed SSH sessions.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    /// Run this instead of the login shell.
    pub command: Option<String>,
}

impl SshConnector {
    pub fn shell() -> Self {
        Self { command: None }
    }

    /// Container exec on a remote host, through its docker CLI.
    pub fn container(container: &str, shell: &str) -> Self {
        Self {
            command: Some(format!(
                "docker exec -it {} {}",
                shell_quote(container),
                shell_quote(shell)
            )),
        }
    }

    pub async fn connect(
        &self,
        config: &ConnectorConfig,
        size: TermSize,
        timeout: Duration,
    ) -> Result<TerminalSession, ConnectError> {
        let handle = connect_client(config, timeout).await?;
        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(true, TERM, u32::from(size.cols), u32::from(size.rows), 0, 0, &[])
            .await?;
        match &self.command {
            Some(command) => channel.exec(true, command.as_str()).await?,
            None => channel.request_shell(true).await?,
        }
        debug!(host = %config.host, port = config.port, command = ?self.command, "SSH terminal opened");
        Ok(TerminalSession::spawn(move |input, output| {
            drive(handle, channel, input, output)
        }))
    }
}

async fn drive(
    handle: ClientHandle,
    mut channel: russh::Channel<client::Msg>,
    mut input: mpsc::Receiver<SessionInput>,
    output: mpsc::Sender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                    if output.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "Remote shell exited");
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            cmd = input.recv() => match cmd {
                Some(SessionInput::Data(data)) => {
                    if channel.data(&data[..]).await.is_err() {
                        break;
                    }
                }
                Some(SessionInput::Resize { rows, cols }) => {
                    if let Err(e) = channel.window_change(u32::from(cols), u32::from(rows), 0, 0).await {
                        debug!(error = %e, "Window change failed");
                    }
                }
                Some(SessionInput::Close) | None => {
                    let _ = channel.eof().await;
                    break;
                }
            },
        }
    }
    let _ = channel.close().await;
    let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
}

/// Result of a non-interactive command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_status: Option<u32>,
    pub output: String,
}

/// Run `command` without a PTY. `timeout` covers the command itself; the
/// connection gets `connect_timeout`.
pub async fn run_command(
    config: &ConnectorConfig,
    command: &str,
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<CommandOutput, ConnectError> {
    let handle = connect_client(config, connect_timeout).await?;
    let result = tokio::time::timeout(timeout, exec_collect(&handle, command))
        .await
        .unwrap_or(Err(ConnectError::CommandTimeout));
    let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
    result
}

async fn exec_collect(handle: &ClientHandle, command: &str) -> Result<CommandOutput, ConnectError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;
    let mut out = CommandOutput::default();
    let mut bytes = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => bytes.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => out.exit_status = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    out.output = String::from_utf8_lossy(&bytes).into_owned();
    Ok(out)
}
