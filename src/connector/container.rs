//! Container exec on the local engine.

use std::time::Duration;

use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{ConnectError, SessionInput, TermSize, TerminalSession};

/// Attach a TTY exec of `shell` inside `container`.
#[derive(Debug, Clone)]
pub struct ContainerConnector {
    pub container: String,
    pub shell: String,
}

impl ContainerConnector {
    pub fn new(container: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            shell: shell.into(),
        }
    }

    pub async fn connect(&self, size: TermSize, timeout: Duration) -> Result<TerminalSession, ConnectError> {
        tokio::time::timeout(timeout, self.start(size))
            .await
            .map_err(|_| ConnectError::Timeout {
                host: format!("container:{}", self.container),
                port: 0,
                secs: timeout.as_secs(),
            })?
    }

    async fn start(&self, size: TermSize) -> Result<TerminalSession, ConnectError> {
        let docker = Docker::connect_with_local_defaults()?;
        let exec = docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(vec!["TERM=xterm-256color".to_string()]),
                    cmd: Some(vec![self.shell.clone()]),
                    ..Default::default()
                },
            )
            .await?;
        let exec_id = exec.id;

        let results = docker
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await?;
        let StartExecResults::Attached { mut output, mut input } = results else {
            return Err(ConnectError::Detached);
        };

        resize(&docker, &exec_id, size.rows, size.cols).await;
        debug!(container = %self.container, shell = %self.shell, exec_id = %exec_id, "Container exec attached");

        Ok(TerminalSession::spawn(move |mut commands, out| async move {
            loop {
                tokio::select! {
                    chunk = output.next() => match chunk {
                        Some(Ok(log)) => {
                            if out.send(log.into_bytes().to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "Exec output ended with error");
                            break;
                        }
                        None => break,
                    },
                    cmd = commands.recv() => match cmd {
                        Some(SessionInput::Data(data)) => {
                            if input.write_all(&data).await.is_err() || input.flush().await.is_err() {
                                break;
                            }
                        }
                        Some(SessionInput::Resize { rows, cols }) => resize(&docker, &exec_id, rows, cols).await,
                        Some(SessionInput::Close) | None => {
                            let _ = input.shutdown().await;
                            break;
                        }
                    },
                }
            }
        }))
    }
}

async fn resize(docker: &Docker, exec_id: &str, rows: u16, cols: u16) {
    if let Err(e) = docker
        .resize_exec(
            exec_id,
            ResizeExecOptions {
                height: rows,
                width: cols,
            },
        )
        .await
    {
        warn!(exec_id = %exec_id, error = %e, "Failed to resize exec");
    }
}
