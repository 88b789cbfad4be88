//! Interactive shell session
//!
//! Requests the PTY and shell on an open channel, then wires the channel to
//! the local terminal until the remote side closes, the transport drops or
//! the session is cancelled.
//!
//! Per session this runs one channel driver (the caller's task), one stdout
//! forwarder, one stderr forwarder and one stdin pump. The forwarders are fed
//! through bounded in-order channels so each direction keeps its byte order.

use std::collections::VecDeque;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::lifecycle::SessionOutcome;
use super::shutdown::{ShutdownReason, ShutdownSignal};

const IO_BUFFER_SIZE: usize = 4096;
const FORWARD_QUEUE_DEPTH: usize = 64;

/// Baud rate advertised for the remote PTY
pub const PTY_BAUD: u32 = 14400;

/// Parameters of the remote pseudo-terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl PtyRequest {
    pub fn new(term: impl Into<String>, cols: u32, rows: u32) -> Self {
        Self {
            term: term.into(),
            cols,
            rows,
        }
    }

    /// Echo on, fixed line speed
    pub fn modes(&self) -> [(Pty, u32); 3] {
        [
            (Pty::ECHO, 1),
            (Pty::TTY_OP_ISPEED, PTY_BAUD),
            (Pty::TTY_OP_OSPEED, PTY_BAUD),
        ]
    }
}

/// What the remote end of a shell channel produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    Closed,
}

/// The remote side of an interactive session
#[async_trait]
pub trait RemoteShell: Send {
    /// Next event, `None` once the channel is gone
    async fn next_event(&mut self) -> Option<ShellEvent>;
    async fn send(&mut self, data: &[u8]) -> Result<(), SshError>;
    async fn resize(&mut self, cols: u32, rows: u32) -> Result<(), SshError>;
    async fn send_eof(&mut self) -> Result<(), SshError>;
    async fn close(&mut self) -> Result<(), SshError>;
}

/// A shell running on a russh session channel
pub struct ChannelShell {
    channel: Channel<Msg>,
    // Messages that arrived while waiting for request replies
    pending: VecDeque<ChannelMsg>,
}

impl ChannelShell {
    /// Request the PTY and a login shell on `channel`. Both requests wait for
    /// the server's reply; a refusal is a [`SshError::PtyFailure`].
    pub async fn open(mut channel: Channel<Msg>, pty: &PtyRequest) -> Result<Self, SshError> {
        let mut pending = VecDeque::new();

        debug!("Requesting PTY {} {}x{}", pty.term, pty.cols, pty.rows);
        channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &pty.modes())
            .await
            .map_err(|e| SshError::PtyFailure(e.to_string()))?;
        await_reply(&mut channel, "pty-req", &mut pending).await?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| SshError::PtyFailure(format!("shell request failed: {}", e)))?;
        await_reply(&mut channel, "shell", &mut pending).await?;

        info!("Interactive shell started ({})", pty.term);
        Ok(Self { channel, pending })
    }

    fn translate(msg: ChannelMsg) -> Option<ShellEvent> {
        match msg {
            ChannelMsg::Data { data } => Some(ShellEvent::Stdout(data.to_vec())),
            ChannelMsg::ExtendedData { data, ext } => {
                if ext != 1 {
                    debug!("Extended data stream {} relayed as stderr", ext);
                }
                Some(ShellEvent::Stderr(data.to_vec()))
            }
            ChannelMsg::ExitStatus { exit_status } => Some(ShellEvent::ExitStatus(exit_status)),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                Some(ShellEvent::ExitSignal(format!("{:?}", signal_name)))
            }
            ChannelMsg::Eof => Some(ShellEvent::Eof),
            ChannelMsg::Close => Some(ShellEvent::Closed),
            _ => None,
        }
    }
}

async fn await_reply(
    channel: &mut Channel<Msg>,
    request: &str,
    pending: &mut VecDeque<ChannelMsg>,
) -> Result<(), SshError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(SshError::PtyFailure(format!(
                    "server refused {} request",
                    request
                )))
            }
            Some(ChannelMsg::WindowAdjusted { .. }) => {}
            Some(ChannelMsg::Close) | None => {
                return Err(SshError::PtyFailure(format!(
                    "channel closed while waiting for {} reply",
                    request
                )))
            }
            Some(other) => pending.push_back(other),
        }
    }
}

#[async_trait]
impl RemoteShell for ChannelShell {
    async fn next_event(&mut self) -> Option<ShellEvent> {
        while let Some(msg) = self.pending.pop_front() {
            if let Some(event) = Self::translate(msg) {
                return Some(event);
            }
        }
        loop {
            let msg = self.channel.wait().await?;
            if let Some(event) = Self::translate(msg) {
                return Some(event);
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| SshError::TransportFailure(e.to_string()))
    }

    async fn resize(&mut self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.channel
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| SshError::ChannelError(format!("window change failed: {}", e)))
    }

    async fn send_eof(&mut self) -> Result<(), SshError> {
        self.channel
            .eof()
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.channel
            .close()
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }
}

/// Local end of a session: where bytes come from and go to
pub struct LocalIo {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
    /// New terminal sizes as (cols, rows)
    pub resize_rx: Option<mpsc::Receiver<(u32, u32)>>,
}

impl LocalIo {
    /// The process's own stdio
    pub fn process(resize_rx: Option<mpsc::Receiver<(u32, u32)>>) -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            resize_rx,
        }
    }
}

enum LoopEnd {
    Cancelled,
    RemoteClosed,
    Lost(String),
}

/// Relay between `shell` and `io` until the session ends.
///
/// The shutdown signal is triggered with `SessionEnded` on the way out (a
/// no-op if it already fired), which stops the stdin pump. The channel is
/// closed exactly once.
pub async fn stream_session<S: RemoteShell>(
    mut shell: S,
    io: LocalIo,
    shutdown: &ShutdownSignal,
) -> SessionOutcome {
    let token = shutdown.token();
    let LocalIo {
        stdin,
        stdout,
        stderr,
        mut resize_rx,
    } = io;

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(FORWARD_QUEUE_DEPTH);
    let (err_tx, err_rx) = mpsc::channel::<Vec<u8>>(FORWARD_QUEUE_DEPTH);
    let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(FORWARD_QUEUE_DEPTH);

    let stdout_task = spawn_forwarder("stdout", out_rx, stdout, token.clone());
    let stderr_task = spawn_forwarder("stderr", err_rx, stderr, token.clone());
    let stdin_task = spawn_stdin_pump(stdin, in_tx, token.clone());

    let mut stdin_open = true;
    let mut exit_status = None;
    let mut exit_signal = None;

    let end = loop {
        tokio::select! {
            _ = token.cancelled() => break LoopEnd::Cancelled,

            event = shell.next_event() => match event {
                Some(ShellEvent::Stdout(data)) => {
                    if out_tx.send(data).await.is_err() {
                        debug!("stdout forwarder gone");
                    }
                }
                Some(ShellEvent::Stderr(data)) => {
                    if err_tx.send(data).await.is_err() {
                        debug!("stderr forwarder gone");
                    }
                }
                Some(ShellEvent::ExitStatus(code)) => {
                    info!("Remote exit status {}", code);
                    exit_status = Some(code);
                }
                Some(ShellEvent::ExitSignal(signal)) => {
                    info!("Remote exit signal {}", signal);
                    exit_signal = Some(signal);
                }
                Some(ShellEvent::Eof) => debug!("Remote EOF"),
                Some(ShellEvent::Closed) => break LoopEnd::RemoteClosed,
                None if exit_status.is_some() || exit_signal.is_some() => {
                    break LoopEnd::RemoteClosed
                }
                None => break LoopEnd::Lost("channel closed without exit status".to_string()),
            },

            chunk = in_rx.recv(), if stdin_open => match chunk {
                Some(data) => {
                    if let Err(e) = shell.send(&data).await {
                        warn!("Sending to remote failed: {}", e);
                        break LoopEnd::Lost(e.to_string());
                    }
                }
                None => {
                    debug!("Local stdin closed, sending EOF");
                    stdin_open = false;
                    if let Err(e) = shell.send_eof().await {
                        debug!("EOF not delivered: {}", e);
                    }
                }
            },

            size = next_resize(&mut resize_rx) => match size {
                Some((cols, rows)) => {
                    if let Err(e) = shell.resize(cols, rows).await {
                        warn!("Failed to resize PTY: {}", e);
                    } else {
                        debug!("PTY resized to {}x{}", cols, rows);
                    }
                }
                None => resize_rx = None,
            },
        }
    };

    if let Err(e) = shell.close().await {
        debug!("Channel close: {}", e);
    }

    // Let the forwarders drain what they already have
    drop(out_tx);
    drop(err_tx);
    for task in [stdout_task, stderr_task] {
        if let Err(e) = task.await {
            warn!("Forwarder task failed: {}", e);
        }
    }

    shutdown.trigger(ShutdownReason::SessionEnded);
    if let Err(e) = stdin_task.await {
        warn!("stdin pump failed: {}", e);
    }

    match end {
        LoopEnd::Cancelled => {
            info!("Session cancelled ({:?})", shutdown.reason());
            SessionOutcome::Cancelled
        }
        LoopEnd::RemoteClosed => SessionOutcome::from_remote_exit(exit_status, exit_signal),
        LoopEnd::Lost(reason) => SessionOutcome::ConnectionLost { reason },
    }
}

async fn next_resize(rx: &mut Option<mpsc::Receiver<(u32, u32)>>) -> Option<(u32, u32)> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn spawn_forwarder(
    name: &'static str,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut out: Box<dyn AsyncWrite + Send + Unpin>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(data) => {
                        if let Err(e) = write_chunk(&mut out, &data).await {
                            warn!("Local {} write failed: {}", name, e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = out.flush().await;
        debug!("{} forwarder finished", name);
    })
}

async fn write_chunk(
    out: &mut Box<dyn AsyncWrite + Send + Unpin>,
    data: &[u8],
) -> std::io::Result<()> {
    out.write_all(data).await?;
    out.flush().await
}

fn spawn_stdin_pump(
    mut stdin: Box<dyn AsyncRead + Send + Unpin>,
    tx: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; IO_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                read = stdin.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Local stdin read failed: {}", e);
                        break;
                    }
                },
            }
        }
        debug!("stdin pump finished");
    })
}
