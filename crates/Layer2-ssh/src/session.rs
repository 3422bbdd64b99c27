//! One SSH connection: connect, authenticate, run commands

use crate::command::{prepare_command, CommandOutput, CommandSpec, ExecOptions};
use crate::error::{Result, SshError};
use crate::stream::{InteractiveStream, StreamRequest};
use crate::target::{SshAuth, SshTarget};
use burrow_foundation::{OutputEvent, ProgressSink};
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Accepts any host key; freshly built containers get new keys every time.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Output collected from a channel
#[derive(Debug, Default)]
pub(crate) struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

impl Capture {
    /// Fold one message in; true once the channel is closed
    pub(crate) fn handle(&mut self, msg: &ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.stdout.extend_from_slice(data);
                false
            }
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                self.stderr.extend_from_slice(data);
                false
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_code = Some(*exit_status as i32);
                false
            }
            ChannelMsg::Close => true,
            _ => false,
        }
    }

    /// Killed by a signal leaves no exit status; report -1
    pub(crate) fn finish(self) -> CommandOutput {
        CommandOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code.unwrap_or(-1),
        }
    }
}

/// Live output for a progress sink
pub(crate) fn output_event(msg: &ChannelMsg) -> Option<OutputEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(OutputEvent::stdout(
            String::from_utf8_lossy(data).into_owned(),
        )),
        ChannelMsg::ExtendedData { data, ext: 1 } => Some(OutputEvent::stderr(
            String::from_utf8_lossy(data).into_owned(),
        )),
        _ => None,
    }
}

/// An authenticated SSH connection
pub struct SshSession {
    handle: Handle<ClientHandler>,
    target: String,
}

impl SshSession {
    /// Connect and authenticate within `connect_timeout`
    pub async fn connect(target: &SshTarget, connect_timeout: Duration) -> Result<Self> {
        let address = target.display();
        let config = Arc::new(Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });

        debug!(host = %address, "Connecting");
        let connect = client::connect(config, (target.host.as_str(), target.port), ClientHandler);
        let mut handle = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| SshError::Timeout {
                what: format!("SSH connect to {}", address),
                elapsed_secs: connect_timeout.as_secs(),
            })?
            .map_err(|e| SshError::Connect {
                target: address.clone(),
                message: e.to_string(),
            })?;

        let result = match &target.auth {
            SshAuth::Key(path) => {
                let key = russh::keys::load_secret_key(path, None).map_err(|e| {
                    SshError::KeyLoad {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    }
                })?;
                // SHA-256 for RSA keys when offered, ignored otherwise
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                handle
                    .authenticate_publickey(
                        target.username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await?
            }
            SshAuth::Password(password) => {
                handle
                    .authenticate_password(target.username.clone(), password.clone())
                    .await?
            }
        };

        if !matches!(result, AuthResult::Success) {
            return Err(SshError::Authentication { target: address });
        }

        Ok(Self {
            handle,
            target: address,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run a command to completion, streaming output to `sink` as it arrives
    pub async fn exec(
        &self,
        spec: &CommandSpec,
        options: &ExecOptions,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<CommandOutput> {
        let prepared = prepare_command(spec, options)?;
        debug!(target = %self.target, command = %prepared.command_line, "Executing");

        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, prepared.command_line.as_str()).await?;
        if let Some(stdin) = &prepared.stdin {
            channel.data(&stdin[..]).await?;
        }
        channel.eof().await?;

        let mut capture = Capture::default();
        while let Some(msg) = channel.wait().await {
            if let (Some(sink), Some(event)) = (sink, output_event(&msg)) {
                sink.output(event);
            }
            if capture.handle(&msg) {
                break;
            }
        }
        let _ = channel.close().await;

        let output = capture.finish();
        debug!(target = %self.target, exit_code = output.exit_code, "Command finished");
        Ok(output)
    }

    /// Open a PTY channel; the stream owns this session from now on
    pub async fn open_stream(self, request: &StreamRequest) -> Result<InteractiveStream> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(
                true,
                &request.term,
                request.size.cols,
                request.size.rows,
                0,
                0,
                &[],
            )
            .await?;
        match &request.command {
            Some(command) => channel.exec(true, command.as_str()).await?,
            None => channel.request_shell(true).await?,
        }
        Ok(InteractiveStream::spawn(self, channel))
    }

    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
