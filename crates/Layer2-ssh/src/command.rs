//! Remote command construction and results

use crate::error::{Result, SshError};
use std::collections::BTreeMap;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Argument vector, each element shell-quoted
    Argv(Vec<String>),
    /// Shell script fed on stdin to `bash -s`
    Script(String),
}

impl CommandSpec {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn script(script: impl Into<String>) -> Self {
        CommandSpec::Script(script.into())
    }
}

/// Where and with what environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr lines, for error messages
    pub fn stderr_tail(&self, lines: usize) -> String {
        let kept: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        kept[kept.len().saturating_sub(lines)..].join("\n")
    }
}

/// Command line plus optional stdin payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub command_line: String,
    pub stdin: Option<Vec<u8>>,
}

fn quote(arg: &str) -> Result<String> {
    shlex::try_quote(arg)
        .map(|q| q.into_owned())
        .map_err(|e| SshError::InvalidCommand(format!("cannot quote {:?}: {}", arg, e)))
}

fn valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Build the command line sent to the remote shell
pub fn prepare_command(spec: &CommandSpec, options: &ExecOptions) -> Result<PreparedCommand> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(cwd) = &options.cwd {
        parts.push(format!("cd {} &&", quote(cwd)?));
    }

    if !options.env.is_empty() {
        parts.push("env".to_string());
        for (key, value) in &options.env {
            if !valid_env_name(key) {
                return Err(SshError::InvalidCommand(format!(
                    "invalid environment variable name: {:?}",
                    key
                )));
            }
            parts.push(quote(&format!("{}={}", key, value))?);
        }
    }

    let stdin = match spec {
        CommandSpec::Argv(args) => {
            if args.is_empty() {
                return Err(SshError::InvalidCommand("empty argument vector".to_string()));
            }
            for arg in args {
                parts.push(quote(arg)?);
            }
            None
        }
        CommandSpec::Script(script) => {
            parts.push("bash -s".to_string());
            Some(script.as_bytes().to_vec())
        }
    };

    Ok(PreparedCommand {
        command_line: parts.join(" "),
        stdin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_is_quoted() {
        let prepared = prepare_command(
            &CommandSpec::argv(["echo", "hello world", "it's"]),
            &ExecOptions::default(),
        )
        .unwrap();
        assert_eq!(
            shlex::split(&prepared.command_line).unwrap(),
            vec!["echo", "hello world", "it's"]
        );
        assert!(prepared.stdin.is_none());
    }

    #[test]
    fn test_script_goes_to_stdin() {
        let prepared = prepare_command(
            &CommandSpec::script("set -e\necho hi\n"),
            &ExecOptions::default().with_cwd("/srv/app"),
        )
        .unwrap();
        assert_eq!(
            shlex::split(&prepared.command_line).unwrap(),
            vec!["cd", "/srv/app", "&&", "bash", "-s"]
        );
        assert_eq!(prepared.stdin.as_deref(), Some(&b"set -e\necho hi\n"[..]));
    }

    #[test]
    fn test_env_prefix() {
        let prepared = prepare_command(
            &CommandSpec::argv(["printenv", "GREETING"]),
            &ExecOptions::default()
                .with_env("GREETING", "hi there")
                .with_env("DEBIAN_FRONTEND", "noninteractive"),
        )
        .unwrap();
        assert_eq!(
            shlex::split(&prepared.command_line).unwrap(),
            vec![
                "env",
                "DEBIAN_FRONTEND=noninteractive",
                "GREETING=hi there",
                "printenv",
                "GREETING"
            ]
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(prepare_command(&CommandSpec::Argv(vec![]), &ExecOptions::default()).is_err());
        assert!(prepare_command(
            &CommandSpec::argv(["true"]),
            &ExecOptions::default().with_env("BAD-NAME", "x")
        )
        .is_err());
    }

    #[test]
    fn test_stderr_tail() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "a\n\nb\nc\n".into(),
            exit_code: 1,
        };
        assert_eq!(output.stderr_tail(2), "b\nc");
        assert!(!output.success());
    }
}
