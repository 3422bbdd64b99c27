//! Hypervisor-specific error types
//!
//! ProxmoxError carries the detail of a failed API call or poll.
//! Converts into burrow_foundation::Error at crate boundaries.

use burrow_foundation::Error as FoundationError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxmoxError>;

/// Errors from the Proxmox API and the pollers built on it
#[derive(Error, Debug, Clone)]
pub enum ProxmoxError {
    // ========================================================================
    // Configuration
    // ========================================================================
    /// Missing or unusable connection settings
    #[error("Proxmox configuration error: {0}")]
    Configuration(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// Non-2xx response
    #[error("Proxmox API {method} {path} failed with HTTP {status}: {message}")]
    Http {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    /// Connection refused, DNS, TLS, request timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Body did not match the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // ========================================================================
    // Tasks and polling
    // ========================================================================
    /// Task stopped with an exit status other than `OK`
    #[error("Task {upid} failed: {exitstatus}")]
    TaskFailed { upid: String, exitstatus: String },

    /// A poller ran out of budget
    #[error("Timed out after {elapsed_secs}s waiting for {resource}")]
    Timeout { resource: String, elapsed_secs: u64 },

    /// Resource reached a state that rules out the awaited one
    #[error("{resource} is {state}, expected {expected}")]
    UnexpectedState {
        resource: String,
        state: String,
        expected: String,
    },
}

impl ProxmoxError {
    /// Build from a failed response
    pub fn from_http_status(method: &str, path: &str, status: u16, body: &str) -> Self {
        ProxmoxError::Http {
            method: method.to_string(),
            path: path.to_string(),
            status,
            message: extract_message(body),
        }
    }

    /// Status fetches worth retrying inside a poll budget
    pub fn is_transient(&self) -> bool {
        match self {
            ProxmoxError::Network(_) | ProxmoxError::InvalidResponse(_) => true,
            ProxmoxError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// The id was taken between allocation and create/clone
    pub fn is_already_exists(&self) -> bool {
        match self {
            ProxmoxError::Http { message, .. } | ProxmoxError::TaskFailed {
                exitstatus: message,
                ..
            } => message.contains("already exists"),
            _ => false,
        }
    }

    /// The referenced container (or task) is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            ProxmoxError::Http {
                status, message, ..
            } => {
                *status == 404
                    || message.contains("does not exist")
                    || message.contains("no such")
                    || message.contains("not found")
            }
            ProxmoxError::TaskFailed { exitstatus, .. } => exitstatus.contains("does not exist"),
            _ => false,
        }
    }
}

/// Pull a human-readable message out of an error body
///
/// Proxmox answers with `{"data":null,"message":"..."}` or with
/// `{"errors":{"param":"reason"}}` for parameter validation failures.
fn extract_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = json.get("message").and_then(|m| m.as_str()) {
            return message.trim().to_string();
        }
        if let Some(errors) = json.get("errors").and_then(|e| e.as_object()) {
            let mut parts: Vec<String> = errors
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v.as_str().unwrap_or_default().trim()))
                .collect();
            parts.sort();
            return parts.join("; ");
        }
    }
    body.trim().to_string()
}

impl From<reqwest::Error> for ProxmoxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProxmoxError::InvalidResponse(err.to_string())
        } else {
            ProxmoxError::Network(err.to_string())
        }
    }
}

// ============================================================================
// burrow_foundation::Error conversion
// ============================================================================

impl From<ProxmoxError> for FoundationError {
    fn from(err: ProxmoxError) -> Self {
        match err {
            ProxmoxError::Configuration(msg) => FoundationError::Config(msg),
            ProxmoxError::Timeout { .. } => FoundationError::Timeout(err.to_string()),
            other => FoundationError::Hypervisor(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_message_variants() {
        let err = ProxmoxError::from_http_status(
            "POST",
            "/nodes/pve/lxc",
            500,
            r#"{"data":null,"message":"unable to create CT 500 - CT 500 already exists on node 'pve'\n"}"#,
        );
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());

        let err = ProxmoxError::from_http_status(
            "POST",
            "/nodes/pve/lxc",
            400,
            r#"{"errors":{"vmid":"invalid format"},"data":null}"#,
        );
        assert!(err.to_string().contains("vmid: invalid format"));
    }

    #[test]
    fn test_not_found_detection() {
        let err = ProxmoxError::from_http_status(
            "GET",
            "/nodes/pve/lxc/999/status/current",
            500,
            r#"{"data":null,"message":"Configuration file 'nodes/pve/lxc/999.conf' does not exist\n"}"#,
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProxmoxError::Network("reset".into()).is_transient());
        assert!(ProxmoxError::from_http_status("GET", "/x", 503, "").is_transient());
        assert!(!ProxmoxError::from_http_status("GET", "/x", 401, "").is_transient());
        assert!(!ProxmoxError::TaskFailed {
            upid: "UPID:pve".into(),
            exitstatus: "ERROR".into()
        }
        .is_transient());
    }

    #[test]
    fn test_into_foundation_error() {
        let err: FoundationError = ProxmoxError::Timeout {
            resource: "ct 500".into(),
            elapsed_secs: 60,
        }
        .into();
        assert!(matches!(err, FoundationError::Timeout(_)));

        let err: FoundationError = ProxmoxError::Configuration("missing host".into()).into();
        assert!(matches!(err, FoundationError::Config(_)));
    }
}
