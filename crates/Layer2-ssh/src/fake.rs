//! Scripted executor for tests
//!
//! Records every command and answers from a list of substring rules. The
//! first rule whose needle appears in the command line or the piped script
//! wins; anything unmatched succeeds with empty output, except the readiness
//! check which answers `ready`.

use crate::command::{prepare_command, CommandOutput, CommandSpec, ExecOptions};
use crate::error::{Result, SshError};
use crate::executor::RemoteExecutor;
use crate::stream::{InteractiveStream, StreamChunk, StreamCommand, StreamRequest};
use crate::target::SshTarget;
use async_trait::async_trait;
use burrow_foundation::{OutputEvent, ProgressSink};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One command seen by [`ScriptedExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub host: String,
    pub command_line: String,
    /// Script piped on stdin, if any
    pub script: Option<String>,
}

impl ExecutedCommand {
    pub fn contains(&self, needle: &str) -> bool {
        self.command_line.contains(needle)
            || self.script.as_deref().is_some_and(|s| s.contains(needle))
    }
}

struct Rule {
    needle: String,
    output: CommandOutput,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    refusals_left: u32,
    commands: Vec<ExecutedCommand>,
    streams: Vec<(String, Option<String>)>,
}

/// In-memory [`RemoteExecutor`]
#[derive(Default)]
pub struct ScriptedExecutor {
    state: Mutex<State>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer matching commands with `stdout` and exit 0
    pub fn respond(&self, needle: impl Into<String>, stdout: impl Into<String>) {
        self.state.lock().rules.push(Rule {
            needle: needle.into(),
            output: CommandOutput {
                stdout: stdout.into(),
                stderr: String::new(),
                exit_code: 0,
            },
        });
    }

    /// Fail matching commands with `exit_code` and `stderr`
    pub fn fail_on(&self, needle: impl Into<String>, exit_code: i32, stderr: impl Into<String>) {
        self.state.lock().rules.push(Rule {
            needle: needle.into(),
            output: CommandOutput {
                stdout: String::new(),
                stderr: stderr.into(),
                exit_code,
            },
        });
    }

    /// Forget every rule; later commands succeed again
    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
    }

    /// Refuse the next `count` connections
    pub fn refuse_connections(&self, count: u32) {
        self.state.lock().refusals_left = count;
    }

    pub fn commands(&self) -> Vec<ExecutedCommand> {
        self.state.lock().commands.clone()
    }

    /// Commands sent to one host
    pub fn commands_for(&self, host: &str) -> Vec<ExecutedCommand> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.host == host)
            .cloned()
            .collect()
    }

    /// `(host, command)` for every stream opened
    pub fn streams(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().streams.clone()
    }

    fn refuse(&self, target: &SshTarget) -> Option<SshError> {
        let mut state = self.state.lock();
        if state.refusals_left == 0 {
            return None;
        }
        state.refusals_left = state.refusals_left.saturating_sub(1);
        Some(SshError::Connect {
            target: target.display(),
            message: "Connection refused".to_string(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn exec(
        &self,
        target: &SshTarget,
        spec: &CommandSpec,
        options: &ExecOptions,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<CommandOutput> {
        let prepared = prepare_command(spec, options)?;
        let executed = ExecutedCommand {
            host: target.host.clone(),
            command_line: prepared.command_line,
            script: prepared
                .stdin
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        };

        let refused = self.refuse(target);
        let output = {
            let mut state = self.state.lock();
            state.commands.push(executed.clone());
            if let Some(err) = refused {
                return Err(err);
            }
            state
                .rules
                .iter()
                .find(|rule| executed.contains(&rule.needle))
                .map(|rule| rule.output.clone())
                .unwrap_or_else(|| CommandOutput {
                    stdout: if executed.command_line == "echo ready" {
                        "ready\n".to_string()
                    } else {
                        String::new()
                    },
                    stderr: String::new(),
                    exit_code: 0,
                })
        };

        if let Some(sink) = sink {
            if !output.stdout.is_empty() {
                sink.output(OutputEvent::stdout(output.stdout.clone()));
            }
            if !output.stderr.is_empty() {
                sink.output(OutputEvent::stderr(output.stderr.clone()));
            }
        }
        Ok(output)
    }

    /// Echoes input back as stdout until closed
    async fn open_stream(
        &self,
        target: &SshTarget,
        request: &StreamRequest,
    ) -> Result<InteractiveStream> {
        if let Some(err) = self.refuse(target) {
            return Err(err);
        }
        self.state
            .lock()
            .streams
            .push((target.host.clone(), request.command.clone()));

        let (command_tx, mut command_rx) = mpsc::channel(16);
        let (output_tx, output_rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    StreamCommand::Input(bytes) => {
                        if output_tx.send(StreamChunk::Stdout(bytes)).await.is_err() {
                            break;
                        }
                    }
                    StreamCommand::Resize(_) => {}
                    StreamCommand::Close => {
                        let _ = output_tx.send(StreamChunk::Exit(0)).await;
                        break;
                    }
                }
            }
        });
        Ok(InteractiveStream::from_parts(command_tx, output_rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SshAuth;
    use burrow_foundation::{BuildEvent, ChannelProgress};

    fn target() -> SshTarget {
        SshTarget::new("10.0.0.9", SshAuth::Password("pw".into()))
    }

    #[tokio::test]
    async fn test_rules_match_piped_script() {
        let executor = ScriptedExecutor::new();
        executor.fail_on("install-docker", 100, "E: Unable to locate package");

        let output = executor
            .exec(
                &target(),
                &CommandSpec::script("echo install-docker"),
                &ExecOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 100);
        assert_eq!(executor.commands()[0].command_line, "bash -s");
    }

    #[tokio::test]
    async fn test_output_reaches_sink() {
        let executor = ScriptedExecutor::new();
        executor.respond("uname", "Linux\n");
        let (sink, mut rx) = ChannelProgress::channel();

        executor
            .exec(&target(), &CommandSpec::argv(["uname"]), &ExecOptions::default(), Some(&sink))
            .await
            .unwrap();
        match rx.try_recv().unwrap() {
            BuildEvent::Output(event) => assert_eq!(event.data, "Linux\n"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_echo_stream() {
        let executor = ScriptedExecutor::new();
        let mut stream = executor
            .open_stream(&target(), &StreamRequest::shell())
            .await
            .unwrap();

        stream.write("pwd\n").await.unwrap();
        assert_eq!(stream.recv().await, Some(StreamChunk::Stdout(b"pwd\n".to_vec())));
        stream.close().await.unwrap();
        assert_eq!(executor.streams(), vec![("10.0.0.9".to_string(), None)]);
    }
}
