//! Pollers for asynchronous hypervisor operations
//!
//! Proxmox has no completion callbacks, so every wait is a fixed-interval
//! sleep loop with a hard wall-clock budget:
//!
//! - [`wait_for_task`] - a UPID reaches `stopped`
//! - [`wait_for_running`] - a container reports `running`
//! - [`wait_for_network`] - a container has an IPv4 on an interface

use crate::api::HypervisorApi;
use crate::error::{ProxmoxError, Result};
use crate::types::{ContainerState, TaskStatus};
use crate::upid::Upid;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Options
// ============================================================================

/// Budget and cadence of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollOptions {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// 120s budget, 2s interval
    pub fn task() -> Self {
        Self::new(Duration::from_secs(120), Duration::from_secs(2))
    }

    /// 60s budget, 2s interval
    pub fn running() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(2))
    }

    /// 90s budget, 3s interval
    pub fn network() -> Self {
        Self::new(Duration::from_secs(90), Duration::from_secs(3))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::task()
    }
}

/// Options for [`wait_for_network`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkWaitOptions {
    pub poll: PollOptions,
    /// Interface inside the guest
    pub interface: String,
    /// How long to wait before nudging the guest's DHCP client
    pub dhcp_trigger_after: Duration,
}

impl Default for NetworkWaitOptions {
    fn default() -> Self {
        Self {
            poll: PollOptions::network(),
            interface: "eth0".to_string(),
            dhcp_trigger_after: Duration::from_secs(15),
        }
    }
}

/// Nudges a guest into requesting a DHCP lease
///
/// Called at most once per wait. Failures are the implementor's to log;
/// polling continues regardless.
#[async_trait]
pub trait DhcpTrigger: Send + Sync {
    async fn trigger(&self, node: &str, vmid: u32, interface: &str);
}

// ============================================================================
// Waiters
// ============================================================================

/// Wait for a task to stop
///
/// `stopped` with exit status `OK` succeeds. Any other exit status fails at
/// once. Status fetch errors are retried until the budget runs out, then the
/// last one is returned.
pub async fn wait_for_task(
    api: &dyn HypervisorApi,
    upid: &Upid,
    options: PollOptions,
) -> Result<TaskStatus> {
    let started = Instant::now();
    let mut last_error: Option<ProxmoxError> = None;

    loop {
        match api.get_task_status(upid).await {
            Ok(status) if status.is_finished() => {
                if status.is_success() {
                    debug!(upid = %upid, elapsed_ms = started.elapsed().as_millis() as u64, "Task finished");
                    return Ok(status);
                }
                return Err(ProxmoxError::TaskFailed {
                    upid: upid.to_string(),
                    exitstatus: status.exitstatus.unwrap_or_default(),
                });
            }
            Ok(_) => last_error = None,
            Err(e) => {
                debug!(upid = %upid, "Task status fetch failed, retrying: {}", e);
                last_error = Some(e);
            }
        }

        if started.elapsed() >= options.timeout {
            return Err(last_error.unwrap_or_else(|| ProxmoxError::Timeout {
                resource: format!("task {}", upid),
                elapsed_secs: options.timeout.as_secs(),
            }));
        }
        sleep(options.interval).await;
    }
}

/// Wait for a container to report `running`; `stopped` fails fast
pub async fn wait_for_running(
    api: &dyn HypervisorApi,
    node: &str,
    vmid: u32,
    options: PollOptions,
) -> Result<()> {
    let started = Instant::now();

    loop {
        match api.get_container_status(node, vmid).await {
            Ok(status) => match status.status {
                ContainerState::Running => return Ok(()),
                ContainerState::Stopped => {
                    return Err(ProxmoxError::UnexpectedState {
                        resource: format!("container {}", vmid),
                        state: ContainerState::Stopped.as_str().to_string(),
                        expected: ContainerState::Running.as_str().to_string(),
                    })
                }
                ContainerState::Unknown => {}
            },
            Err(e) => debug!(vmid, "Status fetch failed, retrying: {}", e),
        }

        if started.elapsed() >= options.timeout {
            return Err(ProxmoxError::Timeout {
                resource: format!("container {} to run", vmid),
                elapsed_secs: options.timeout.as_secs(),
            });
        }
        sleep(options.interval).await;
    }
}

/// Wait until the container has a usable IPv4 on `options.interface`
///
/// Reported interfaces win; a static `ip=` in the matching `netN` config is
/// the fallback. After `dhcp_trigger_after` the trigger (if any) fires once.
pub async fn wait_for_network(
    api: &dyn HypervisorApi,
    node: &str,
    vmid: u32,
    options: &NetworkWaitOptions,
    trigger: Option<&dyn DhcpTrigger>,
) -> Result<Ipv4Addr> {
    let started = Instant::now();
    let mut triggered = false;

    loop {
        let interfaces = api.get_interfaces(node, vmid).await;
        if let Some(ip) = interfaces
            .iter()
            .filter(|i| i.name == options.interface)
            .find_map(|i| i.ipv4())
        {
            info!(vmid, ip = %ip, "Container network is up");
            return Ok(ip);
        }

        match api.get_container_config(node, vmid).await {
            Ok(config) => {
                if let Some(ip) = config.static_ipv4(&options.interface) {
                    info!(vmid, ip = %ip, "Using static address from config");
                    return Ok(ip);
                }
            }
            Err(e) => debug!(vmid, "Config fetch failed, retrying: {}", e),
        }

        if !triggered && started.elapsed() >= options.dhcp_trigger_after {
            triggered = true;
            if let Some(trigger) = trigger {
                warn!(vmid, interface = %options.interface, "No address yet, triggering DHCP");
                trigger.trigger(node, vmid, &options.interface).await;
            }
        }

        if started.elapsed() >= options.poll.timeout {
            return Err(ProxmoxError::Timeout {
                resource: format!("container {} network on {}", vmid, options.interface),
                elapsed_secs: options.poll.timeout.as_secs(),
            });
        }
        sleep(options.poll.interval).await;
    }
}
