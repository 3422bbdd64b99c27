//! Terminal rendering of progress, records and command output

use burrow_foundation::{
    BuildEvent, ChannelProgress, OutputEvent, ProgressEvent, ProgressSink, StreamKind, Template,
};
use serde::Serialize;
use std::io::Write;
use tokio::task::JoinHandle;

/// Progress printer fed by a channel sink
pub struct ProgressPrinter {
    sink: ChannelProgress,
    handle: JoinHandle<()>,
}

impl ProgressPrinter {
    /// Start printing; output chunks are shown only when `verbose`
    pub fn spawn(verbose: bool) -> Self {
        let (sink, mut rx) = ChannelProgress::channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BuildEvent::Progress(p) => println!("{}", progress_line(&p)),
                    BuildEvent::Output(o) if verbose => print_output(&o),
                    BuildEvent::Output(_) => {}
                }
            }
        });
        Self { sink, handle }
    }

    pub fn sink(&self) -> &ChannelProgress {
        &self.sink
    }

    /// Wait until every queued event has been printed
    pub async fn finish(self) {
        drop(self.sink);
        let _ = self.handle.await;
    }
}

/// Writes remote output straight through, stdout to stdout, stderr to stderr
pub struct PassThrough;

impl ProgressSink for PassThrough {
    fn progress(&self, _event: ProgressEvent) {}

    fn output(&self, event: OutputEvent) {
        print_output(&event);
    }
}

fn print_output(event: &OutputEvent) {
    match event.stream_kind {
        StreamKind::Stdout => {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(event.data.as_bytes());
            let _ = out.flush();
        }
        StreamKind::Stderr => {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(event.data.as_bytes());
            let _ = err.flush();
        }
    }
}

pub fn progress_line(event: &ProgressEvent) -> String {
    format!("[{:>3}%] {:<10} {}", event.progress, event.step, event.message)
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

pub fn print_templates(templates: &[Template]) {
    if templates.is_empty() {
        println!("No templates found.");
        return;
    }

    println!(
        "{:<10} {:<24} {:<9} {:<6} {:<10} {}",
        "ID", "Name", "Status", "VMID", "Parent", "Stacks"
    );
    println!("{}", "-".repeat(80));
    for t in templates {
        let name = if t.is_default {
            format!("{} *", t.name)
        } else {
            t.name.clone()
        };
        println!(
            "{:<10} {:<24} {:<9} {:<6} {:<10} {}",
            short_id(&t.id),
            truncate(&name, 24),
            t.status.as_str(),
            t.vmid.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            t.parent_template_id.as_deref().map(short_id).unwrap_or("-"),
            t.all_tech_stacks().join(",")
        );
        if let Some(message) = &t.error_message {
            println!("{:<10} {}", "", truncate(message, 70));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_alignment() {
        let line = progress_line(&ProgressEvent::new("ssh", 50, "Waiting for SSH"));
        assert_eq!(line, "[ 50%] ssh        Waiting for SSH");
    }

    #[test]
    fn test_short_id_and_truncate() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
        assert_eq!(truncate("abc", 6), "abc");
    }
}
