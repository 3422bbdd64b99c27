//! # burrow-stack
//!
//! Installable software for Burrow containers:
//! - Definition: one stack, its install/verify commands and dependencies
//! - Registry: the built-in catalog, dependency resolution, nesting check
//! - Script: install, verify, core-packages and cleanup scripts

pub mod definition;
pub mod error;
pub mod registry;
pub mod script;

pub use definition::{StackCategory, TechStackDefinition};
pub use error::{Result, StackError};
pub use registry::{catalog, StackRegistry};
pub use script::{
    cleanup_script, core_packages_script, install_script, install_script_for, parse_verify_output,
    verify_script, CORE_PACKAGES,
};
