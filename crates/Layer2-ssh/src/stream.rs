//! Interactive PTY streams
//!
//! A stream owns its SSH session. A background task pumps channel messages
//! into an output queue and applies input, resize and close requests sent
//! from the caller, so reads and writes never block each other.

use crate::error::{Result, SshError};
use crate::session::SshSession;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const OUTPUT_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 64;

/// Terminal size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 120, rows: 24 }
    }
}

/// What to run on the PTY
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// `None` opens a login shell
    pub command: Option<String>,
    pub term: String,
    pub size: PtySize,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            command: None,
            term: "xterm-256color".to_string(),
            size: PtySize::default(),
        }
    }
}

impl StreamRequest {
    pub fn shell() -> Self {
        Self::default()
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, cols: u32, rows: u32) -> Self {
        self.size = PtySize { cols, rows };
        self
    }
}

/// Output from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Remote process exited; more output may still follow before close
    Exit(i32),
}

#[derive(Debug)]
pub(crate) enum StreamCommand {
    Input(Vec<u8>),
    Resize(PtySize),
    Close,
}

/// Map a channel message to a chunk; the flag is true once the channel is done
pub(crate) fn chunk_for(msg: &ChannelMsg) -> (Option<StreamChunk>, bool) {
    match msg {
        ChannelMsg::Data { data } => (Some(StreamChunk::Stdout(data.to_vec())), false),
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            (Some(StreamChunk::Stderr(data.to_vec())), false)
        }
        ChannelMsg::ExitStatus { exit_status } => {
            (Some(StreamChunk::Exit(*exit_status as i32)), false)
        }
        ChannelMsg::Close => (None, true),
        _ => (None, false),
    }
}

/// A bidirectional PTY session
pub struct InteractiveStream {
    commands: mpsc::Sender<StreamCommand>,
    output: mpsc::Receiver<StreamChunk>,
    task: JoinHandle<()>,
}

impl InteractiveStream {
    pub(crate) fn spawn(session: SshSession, channel: Channel<Msg>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let task = tokio::spawn(pump(session, channel, command_rx, output_tx));
        Self::from_parts(command_tx, output_rx, task)
    }

    /// Assemble a stream around an arbitrary pump task
    pub(crate) fn from_parts(
        commands: mpsc::Sender<StreamCommand>,
        output: mpsc::Receiver<StreamChunk>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            output,
            task,
        }
    }

    /// Send keystrokes or raw bytes
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.commands
            .send(StreamCommand::Input(data.into()))
            .await
            .map_err(|_| SshError::StreamClosed)
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.commands
            .send(StreamCommand::Resize(PtySize { cols, rows }))
            .await
            .map_err(|_| SshError::StreamClosed)
    }

    /// Next chunk of output; `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.output.recv().await
    }

    /// Close the channel and wait for the pump to finish
    pub async fn close(self) -> Result<()> {
        // the pump may already be gone if the remote side closed first
        let _ = self.commands.send(StreamCommand::Close).await;
        self.task
            .await
            .map_err(|e| SshError::Channel(format!("stream task failed: {}", e)))
    }
}

async fn pump(
    session: SshSession,
    mut channel: Channel<Msg>,
    mut commands: mpsc::Receiver<StreamCommand>,
    output: mpsc::Sender<StreamChunk>,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => {
                let Some(msg) = msg else { break };
                let (chunk, done) = chunk_for(&msg);
                if let Some(chunk) = chunk {
                    if output.send(chunk).await.is_err() {
                        debug!(target = %session.target(), "Stream reader dropped");
                        break;
                    }
                }
                if done {
                    break;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(StreamCommand::Input(bytes)) => {
                        if let Err(e) = channel.data(&bytes[..]).await {
                            warn!(target = %session.target(), error = %e, "Stream write failed");
                            break;
                        }
                    }
                    Some(StreamCommand::Resize(size)) => {
                        if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                            warn!(target = %session.target(), error = %e, "Stream resize failed");
                        }
                    }
                    Some(StreamCommand::Close) | None => {
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }
                }
            }
        }
    }

    debug!(target = %session.target(), "Stream closed");
    session.close().await;
}
