//! Executor trait and the SSH implementation

use crate::command::{CommandOutput, CommandSpec, ExecOptions};
use crate::error::{Result, SshError};
use crate::session::SshSession;
use crate::stream::{InteractiveStream, StreamRequest};
use crate::target::SshTarget;
use async_trait::async_trait;
use burrow_foundation::ProgressSink;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long and how often to check a freshly started container
#[derive(Debug, Clone, Copy)]
pub struct ReadyWait {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadyWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(2),
        }
    }
}

impl ReadyWait {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Remote command runner - implement to add new transports
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command to completion; output also goes to `sink` as it arrives
    async fn exec(
        &self,
        target: &SshTarget,
        spec: &CommandSpec,
        options: &ExecOptions,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<CommandOutput>;

    /// Open an interactive PTY session
    async fn open_stream(
        &self,
        target: &SshTarget,
        request: &StreamRequest,
    ) -> Result<InteractiveStream>;

    /// Retry `echo ready` until it answers or the wait times out
    async fn wait_for_ssh(&self, target: &SshTarget, wait: ReadyWait) -> Result<()> {
        let started = Instant::now();
        let spec = CommandSpec::argv(["echo", "ready"]);
        let options = ExecOptions::default();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.exec(target, &spec, &options, None).await {
                Ok(output) if output.success() && output.stdout.trim() == "ready" => {
                    info!(target = %target.display(), attempt, "SSH is ready");
                    return Ok(());
                }
                Ok(output) => {
                    debug!(target = %target.display(), attempt, exit_code = output.exit_code, "SSH readiness check answered unexpectedly");
                }
                Err(e) => {
                    debug!(target = %target.display(), attempt, error = %e, "SSH not ready yet");
                }
            }

            if started.elapsed() >= wait.timeout {
                return Err(SshError::Timeout {
                    what: format!("SSH on {}", target.display()),
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(wait.interval).await;
        }
    }
}

/// Opens a fresh connection per call
#[derive(Debug, Clone)]
pub struct SshExecutor {
    connect_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(
        &self,
        target: &SshTarget,
        spec: &CommandSpec,
        options: &ExecOptions,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<CommandOutput> {
        let session = SshSession::connect(target, self.connect_timeout).await?;
        let result = session.exec(spec, options, sink).await;
        session.close().await;
        result
    }

    async fn open_stream(
        &self,
        target: &SshTarget,
        request: &StreamRequest,
    ) -> Result<InteractiveStream> {
        let session = SshSession::connect(target, self.connect_timeout).await?;
        session.open_stream(request).await
    }
}
