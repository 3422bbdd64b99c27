//! Progress events - build milestones and live command output
//!
//! Long-running workflows report through a [`ProgressSink`]. Callers choose
//! where events go:
//!
//! - [`NoopProgress`] - drop everything
//! - [`ChannelProgress`] - forward into a tokio mpsc channel
//! - [`TracingProgress`] - mirror into the log
//! - [`FnProgress`] - wrap a closure

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

// ============================================================================
// Event Types
// ============================================================================

/// A milestone in a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub step: String,
    /// Percentage, 0-100
    pub progress: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(step: impl Into<String>, progress: u8, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            progress: progress.min(100),
            message: message.into(),
        }
    }
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A chunk of raw command output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub stream_kind: StreamKind,
    pub data: String,
}

impl OutputEvent {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream_kind: StreamKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream_kind: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Either kind of event, for sinks that carry both on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BuildEvent {
    Progress(ProgressEvent),
    Output(OutputEvent),
}

// ============================================================================
// Sink Trait
// ============================================================================

/// Receiver of workflow progress
///
/// Implementations must not block; they are called from inside async
/// workflows.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, event: ProgressEvent);

    /// Raw output; ignored unless the sink cares
    fn output(&self, _event: OutputEvent) {}

    fn report(&self, step: &str, progress: u8, message: &str) {
        self.progress(ProgressEvent::new(step, progress, message));
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for std::sync::Arc<S> {
    fn progress(&self, event: ProgressEvent) {
        (**self).progress(event)
    }

    fn output(&self, event: OutputEvent) {
        (**self).output(event)
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn progress(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<BuildEvent>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::UnboundedSender<BuildEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BuildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn progress(&self, event: ProgressEvent) {
        // receiver gone means nobody is listening anymore
        let _ = self.tx.send(BuildEvent::Progress(event));
    }

    fn output(&self, event: OutputEvent) {
        let _ = self.tx.send(BuildEvent::Output(event));
    }
}

/// Mirrors events into `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingProgress {
    /// Label attached to every log line (e.g. a template name)
    pub resource: Option<String>,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_resource(resource: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
        }
    }
}

impl ProgressSink for TracingProgress {
    fn progress(&self, event: ProgressEvent) {
        info!(
            resource = self.resource.as_deref().unwrap_or("-"),
            step = %event.step,
            progress = event.progress,
            "{}",
            event.message
        );
    }

    fn output(&self, event: OutputEvent) {
        for line in event.data.lines().filter(|l| !l.trim().is_empty()) {
            debug!(stream = event.stream_kind.as_str(), "{}", line);
        }
    }
}

/// Adapts a closure into a sink
pub struct FnProgress<F>(pub F);

impl<F> ProgressSink for FnProgress<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn progress(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}
