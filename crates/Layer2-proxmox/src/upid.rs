//! Task handles
//!
//! Every asynchronous Proxmox mutation answers with a UPID:
//!
//! ```text
//! UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:
//! ```
//!
//! Task status has to be queried on the node that owns the task, so the node
//! is parsed out once when the handle is created.

use crate::error::{ProxmoxError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Parsed task handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upid {
    raw: String,
    node: String,
    task_type: String,
    resource_id: String,
}

impl Upid {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() < 8 || parts[0] != "UPID" || parts[1].is_empty() {
            return Err(ProxmoxError::InvalidResponse(format!(
                "not a task id: {:?}",
                raw
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            node: parts[1].to_string(),
            task_type: parts[5].to_string(),
            resource_id: parts[6].to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Node that runs the task
    pub fn node(&self) -> &str {
        &self.node
    }

    /// e.g. `vzcreate`, `vzstart`, `vzdestroy`
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Usually the VMID the task acts on
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Path-safe form
    pub fn encoded(&self) -> String {
        urlencoding::encode(&self.raw).into_owned()
    }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for Upid {
    type Err = ProxmoxError;

    fn from_str(s: &str) -> Result<Self> {
        Upid::parse(s)
    }
}

impl Serialize for Upid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Upid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Upid::parse(&raw).map_err(serde::de::Error::custom)
    }
}
