//! Shared error and warning types
//!
//! `ResourceError` is what every collaborator (namespace provider, qdisc
//! controller, packet I/O, exchange driver) reports when an OS-level
//! operation fails. Components wrap it in their own error enums.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Netlink operation failed: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("System call error: {0}")]
    Nix(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Injected failure: {0}")]
    Injected(String),
}

impl ResourceError {
    /// Build a `Command` error from a finished process
    pub fn command(command: impl Into<String>, stderr: &[u8]) -> Self {
        ResourceError::Command {
            command: command.into(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// Whether the failure means the target interface or namespace is gone
    pub fn is_missing(&self) -> bool {
        match self {
            ResourceError::InterfaceNotFound(_) | ResourceError::NamespaceNotFound(_) => true,
            ResourceError::Command { stderr, .. } => {
                stderr.contains("No such device")
                    || stderr.contains("Cannot find device")
                    || stderr.contains("Cannot open network namespace")
                    || stderr.contains("does not exist")
            }
            ResourceError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// A teardown step that failed; advisory, never part of the verdict
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    /// Resource the step was releasing, e.g. `endpoint client`
    pub resource: String,
    pub error: String,
}

impl CleanupWarning {
    pub fn new(resource: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            resource: resource.into(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup of {} failed: {}", self.resource, self.error)
    }
}
