//! # burrow-ssh
//!
//! Remote command execution for Burrow:
//! - Target: host, port, user and identity resolution
//! - Command: argv/script specs and safe command-line assembly
//! - Session: a russh connection that runs one command at a time
//! - Stream: interactive PTY sessions with resize
//! - Executor: [`RemoteExecutor`] trait, [`SshExecutor`] implementation

pub mod command;
pub mod error;
pub mod executor;
pub mod session;
pub mod stream;
pub mod target;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use command::{prepare_command, CommandOutput, CommandSpec, ExecOptions, PreparedCommand};
pub use error::{Result, SshError};
pub use executor::{ReadyWait, RemoteExecutor, SshExecutor};
pub use session::SshSession;
pub use stream::{InteractiveStream, PtySize, StreamChunk, StreamRequest};
pub use target::{
    candidate_key_paths, resolve_identity, resolve_identity_in, IdentityOptions, SshAuth,
    SshTarget, DEFAULT_KEY_NAMES, DEFAULT_SSH_PORT, DEFAULT_SSH_USER,
};

#[cfg(any(test, feature = "test-utils"))]
pub use fake::{ExecutedCommand, ScriptedExecutor};
