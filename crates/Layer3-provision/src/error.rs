//! Provisioning error taxonomy

use burrow_foundation::Error as FoundationError;
use burrow_proxmox::ProxmoxError;
use burrow_ssh::SshError;
use burrow_stack::StackError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Error, Debug)]
pub enum ProvisionError {
    // ========================================================================
    // Wrapped layer errors
    // ========================================================================
    #[error(transparent)]
    Hypervisor(#[from] ProxmoxError),

    #[error(transparent)]
    Remote(#[from] SshError),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Store(#[from] FoundationError),

    // ========================================================================
    // Orchestration failures
    // ========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A provisioning script exited non-zero
    #[error("Provisioning script failed in container {vmid} (exit {exit_code}): {stderr}")]
    Provisioning {
        vmid: u32,
        exit_code: i32,
        stderr: String,
    },

    #[error("No free VMID between {floor} and {ceiling}")]
    RangeExhausted { floor: u32, ceiling: u32 },

    /// Local record points at a container the hypervisor no longer has
    #[error("Template {template_id} references missing container {vmid}")]
    StaleRecord { template_id: String, vmid: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template {template_id} still has {children} child template(s)")]
    HasChildren { template_id: String, children: usize },

    #[error("Template {template_id} is {status}, expected {expected}")]
    InvalidState {
        template_id: String,
        status: String,
        expected: String,
    },

    /// Failure inside a named lifecycle step
    #[error("{resource}: {step} failed: {source}")]
    Step {
        resource: String,
        step: String,
        #[source]
        source: Box<ProvisionError>,
    },
}

impl ProvisionError {
    /// Attach the resource and step the failure happened in
    pub fn at(self, resource: impl Into<String>, step: impl Into<String>) -> Self {
        match self {
            // keep the innermost step
            err @ ProvisionError::Step { .. } => err,
            err => ProvisionError::Step {
                resource: resource.into(),
                step: step.into(),
                source: Box::new(err),
            },
        }
    }

    /// Error with any step wrappers peeled off
    pub fn root(&self) -> &ProvisionError {
        match self {
            ProvisionError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Step name, if the error was raised inside one
    pub fn step(&self) -> Option<&str> {
        match self {
            ProvisionError::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Hypervisor refused an id as already taken
    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), ProvisionError::Hypervisor(e) if e.is_already_exists())
    }

    /// Hypervisor reports the container gone
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), ProvisionError::Hypervisor(e) if e.is_not_found())
    }
}

/// Wrap any layer error with resource and step context
pub trait StepContext<T> {
    fn step(self, resource: &str, step: &str) -> Result<T>;
}

impl<T, E: Into<ProvisionError>> StepContext<T> for std::result::Result<T, E> {
    fn step(self, resource: &str, step: &str) -> Result<T> {
        self.map_err(|e| e.into().at(resource, step))
    }
}

// ============================================================================
// burrow_foundation::Error conversion
// ============================================================================

impl From<ProvisionError> for FoundationError {
    fn from(err: ProvisionError) -> Self {
        if let ProvisionError::Store(inner) = err {
            return inner;
        }
        let message = err.to_string();
        match err.root() {
            ProvisionError::Configuration(_) | ProvisionError::RangeExhausted { .. } => {
                FoundationError::Config(message)
            }
            ProvisionError::NotFound(_) | ProvisionError::StaleRecord { .. } => {
                FoundationError::NotFound(message)
            }
            ProvisionError::Validation(_)
            | ProvisionError::HasChildren { .. }
            | ProvisionError::InvalidState { .. }
            | ProvisionError::Stack(StackError::UnknownStack(_)) => {
                FoundationError::Validation(message)
            }
            ProvisionError::Provisioning { .. } => FoundationError::Provisioning(message),
            ProvisionError::Hypervisor(ProxmoxError::Timeout { .. })
            | ProvisionError::Remote(SshError::Timeout { .. }) => FoundationError::Timeout(message),
            ProvisionError::Hypervisor(ProxmoxError::Configuration(_)) => {
                FoundationError::Config(message)
            }
            ProvisionError::Hypervisor(_) => FoundationError::Hypervisor(message),
            ProvisionError::Remote(_) => FoundationError::Remote(message),
            _ => FoundationError::Internal(message),
        }
    }
}
