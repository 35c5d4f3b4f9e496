//! Remote command execution in a tenant namespace.
//!
//! Handles:
//! - Turning an authorized session into an exec request (shell fallback, TTY policy)
//! - Pumping bytes between the SSH channel and the remote process
//! - Kubernetes pod exec over the API server's streaming endpoint

use std::future::Future;

use async_trait::async_trait;
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, TerminalSize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::identity::Grant;
use crate::session::{SessionIo, WindowSize};

#[derive(Debug, Error)]
pub enum ExecError {
    /// The remote channel could not be opened.
    #[error("couldn't start remote command: {0}")]
    Connect(String),

    /// A stream failed while the command was running.
    #[error("stream error: {0}")]
    Stream(String),

    /// The remote command reported failure.
    #[error("remote command failed: {0}")]
    Exit(String),
}

/// Fully resolved execution target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Always the namespace the client asked for and was granted.
    pub namespace: String,
    /// Well-known pod the session runs in. Never taken from the client.
    pub pod: String,
    pub command: Vec<String>,
    pub tty: bool,
    /// Terminal size to apply before any output, when a pty was requested.
    pub initial_size: Option<WindowSize>,
}

impl ExecRequest {
    /// Build the request for a granted namespace.
    ///
    /// An empty (or blank) command becomes an interactive `shell` with a TTY,
    /// whatever the client asked for. Other commands run through `shell -c`
    /// and keep the client's TTY choice.
    pub fn new(
        grant: &Grant,
        pod: &str,
        shell: &str,
        command: &str,
        pty: Option<WindowSize>,
    ) -> Self {
        let (command, tty) = if command.trim().is_empty() {
            (vec![shell.to_string()], true)
        } else {
            (
                vec![shell.to_string(), "-c".to_string(), command.to_string()],
                pty.is_some(),
            )
        };

        Self {
            namespace: grant.namespace().to_string(),
            pod: pod.to_string(),
            command,
            tty,
            initial_size: pty,
        }
    }
}

/// Runs a command remotely and streams the session's stdio to it.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Returns once the remote command has exited or a stream failed.
    ///
    /// The streams in `io` are only borrowed so the caller can still report a
    /// failure to the client afterwards.
    async fn exec(&self, request: ExecRequest, io: &mut SessionIo) -> Result<(), ExecError>;
}

/// Copy bytes between the client and a remote process.
///
/// Client input and remote output run concurrently in this task. When the
/// client closes its input the remote stdin is shut down and output keeps
/// flowing. The pump ends when both remote outputs reach EOF or any output
/// copy fails. `alongside` is polled for the same duration (used for resize
/// forwarding) and dropped with the pump.
pub async fn pump<W, R, E, F>(
    io: &mut SessionIo,
    mut remote_stdin: Option<W>,
    remote_stdout: Option<R>,
    remote_stderr: Option<E>,
    alongside: F,
) -> Result<(), ExecError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    F: Future<Output = ()>,
{
    let SessionIo { stdio, stderr, .. } = io;
    let (mut client_in, mut client_out) = tokio::io::split(stdio);

    let input = async {
        match remote_stdin.as_mut() {
            Some(stdin) => {
                let copied = tokio::io::copy(&mut client_in, stdin).await;
                let _ = stdin.shutdown().await;
                copied
            }
            None => std::future::pending().await,
        }
    };

    let stdout_copy = async move {
        if let Some(mut reader) = remote_stdout {
            tokio::io::copy(&mut reader, &mut client_out).await?;
            client_out.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let stderr_copy = async move {
        if let Some(mut reader) = remote_stderr {
            tokio::io::copy(&mut reader, stderr).await?;
            stderr.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let output = async { tokio::try_join!(stdout_copy, stderr_copy).map(|_| ()) };

    tokio::pin!(input);
    tokio::pin!(output);
    tokio::pin!(alongside);
    let mut input_open = true;
    let mut alongside_open = true;

    loop {
        tokio::select! {
            res = &mut output => {
                return res.map_err(|e| ExecError::Stream(e.to_string()));
            }
            res = &mut input, if input_open => {
                input_open = false;
                match res {
                    Ok(n) => debug!("Client input closed after {} bytes", n),
                    Err(e) => debug!("Client input failed: {}", e),
                }
            }
            _ = &mut alongside, if alongside_open => {
                alongside_open = false;
            }
        }
    }
}

/// Pod exec through the Kubernetes API server.
pub struct KubeExecutor {
    client: kube::Client,
}

impl KubeExecutor {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Executor for KubeExecutor {
    async fn exec(&self, request: ExecRequest, io: &mut SessionIo) -> Result<(), ExecError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);

        // With a TTY the remote side merges stderr into stdout.
        let params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(!request.tty)
            .tty(request.tty);

        info!(
            "Exec in {}/{}: {:?} (tty={})",
            request.namespace, request.pod, request.command, request.tty
        );

        let mut attached = pods
            .exec(&request.pod, request.command.clone(), &params)
            .await
            .map_err(|e| ExecError::Connect(e.to_string()))?;

        let status = attached.take_status();

        let mut terminal = if request.tty {
            attached.terminal_size()
        } else {
            None
        };
        if let (Some(tx), Some(size)) = (terminal.as_mut(), request.initial_size) {
            if let Err(e) = tx.send(terminal_size(size)).await {
                debug!("Failed to set initial terminal size: {}", e);
            }
        }

        let resizes = forward_resizes(io.resize.take(), terminal);
        let stdin = attached.stdin();
        let stdout = attached.stdout();
        let stderr = attached.stderr();

        pump(io, stdin, stdout, stderr, resizes).await?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| ExecError::Stream(e.to_string()))?;

        check_status(status)
    }
}

fn terminal_size(size: WindowSize) -> TerminalSize {
    TerminalSize {
        width: size.cols,
        height: size.rows,
    }
}

async fn forward_resizes(
    resize: Option<mpsc::Receiver<WindowSize>>,
    terminal: Option<futures::channel::mpsc::Sender<TerminalSize>>,
) {
    let (Some(mut rx), Some(mut tx)) = (resize, terminal) else {
        return;
    };
    while let Some(size) = rx.recv().await {
        debug!("Resizing remote terminal to {}x{}", size.cols, size.rows);
        if tx.send(terminal_size(size)).await.is_err() {
            break;
        }
    }
}

/// Interpret the status object the API server sends when the process ends.
///
/// Exit codes are not passed on; any failure is just a failure.
fn check_status(status: Option<Status>) -> Result<(), ExecError> {
    match status {
        None => Ok(()),
        Some(s) if s.status.as_deref() == Some("Success") => Ok(()),
        Some(s) => Err(ExecError::Exit(
            s.message
                .or(s.reason)
                .unwrap_or_else(|| "unknown failure".to_string()),
        )),
    }
}
