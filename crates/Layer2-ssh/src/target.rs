//! Connection descriptors and identity resolution
//!
//! Descriptors are cheap and ephemeral: one per command or stream, never
//! pooled.

use crate::error::{Result, SshError};
use std::path::{Path, PathBuf};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";

/// Default key files under `~/.ssh`, in lookup order
pub const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// How to authenticate
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    Key(PathBuf),
    Password(String),
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Key(path) => f.debug_tuple("Key").field(path).finish(),
            SshAuth::Password(_) => f.debug_tuple("Password").field(&"***").finish(),
        }
    }
}

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: DEFAULT_SSH_USER.to_string(),
            auth,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// `user@host:port`, for logs and errors
    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Inputs to identity resolution
#[derive(Debug, Clone, Default)]
pub struct IdentityOptions {
    /// Key passed for this call
    pub explicit_key: Option<PathBuf>,
    /// Key from settings
    pub configured_key: Option<PathBuf>,
    /// Used only when no key file exists
    pub password: Option<String>,
}

/// Candidate key paths in lookup order
pub fn candidate_key_paths(options: &IdentityOptions, home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = options
        .explicit_key
        .iter()
        .chain(options.configured_key.iter())
        .map(|p| expand_home(p, home))
        .collect();
    if let Some(home) = home {
        paths.extend(
            DEFAULT_KEY_NAMES
                .iter()
                .map(|name| home.join(".ssh").join(name)),
        );
    }
    paths
}

/// First existing key, else the supplied password
pub fn resolve_identity(options: &IdentityOptions) -> Result<SshAuth> {
    resolve_identity_in(options, dirs::home_dir().as_deref())
}

/// [`resolve_identity`] against an explicit home directory
pub fn resolve_identity_in(options: &IdentityOptions, home: Option<&Path>) -> Result<SshAuth> {
    let candidates = candidate_key_paths(options, home);
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(SshAuth::Key(found.clone()));
    }
    match &options.password {
        Some(password) if !password.is_empty() => Ok(SshAuth::Password(password.clone())),
        _ => Err(SshError::NoIdentity {
            tried: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

fn expand_home(path: &Path, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
