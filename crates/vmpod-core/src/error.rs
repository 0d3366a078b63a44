//! Error types for vmpod-core.

use crate::config::ConfigError;
use crate::SandboxId;
use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for vmpod-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No sandbox with this ID is registered
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    /// A sandbox with this ID is already registered
    #[error("sandbox already exists: {0}")]
    AlreadyExists(SandboxId),

    /// The VM backend could not create, boot or address the VM
    #[error("provisioning sandbox {id} failed: {message}")]
    Provision {
        /// Sandbox being created
        id: SandboxId,
        /// What went wrong
        message: String,
    },

    /// The guest agent could not be reached at the assigned address
    #[error("connecting to sandbox {id} at {addr} failed: {message}")]
    Connect {
        /// Sandbox being created
        id: SandboxId,
        /// Guest address that was dialled
        addr: IpAddr,
        /// What went wrong
        message: String,
    },

    /// Stopping the sandbox VM failed; the sandbox is still registered
    #[error("stopping sandbox {id} failed: {message}")]
    Stop {
        /// Sandbox being stopped
        id: SandboxId,
        /// What went wrong
        message: String,
    },

    /// Tearing the sandbox VM down failed; the sandbox is no longer registered
    #[error("destroying sandbox {id} failed: {message}")]
    Destroy {
        /// Sandbox being removed
        id: SandboxId,
        /// What went wrong
        message: String,
    },

    /// Some sandboxes could not be torn down during shutdown
    #[error("{failed} of {total} sandboxes failed to tear down")]
    Shutdown {
        /// Teardowns that returned an error
        failed: usize,
        /// Sandboxes that were registered
        total: usize,
    },

    /// The VM backend could not report whether the sandbox VM is running
    #[error("state of sandbox {id} is unknown: {message}")]
    StateUnknown {
        /// Sandbox being inspected
        id: SandboxId,
        /// Why the query failed
        message: String,
    },

    /// Operation not supported by this provider
    #[error("{0} is not implemented by this provider")]
    Unimplemented(&'static str),

    /// No provider registered under this name
    #[error("unknown provider {name:?} (known: {known})")]
    UnknownProvider {
        /// Requested provider
        name: String,
        /// Comma-separated registered names
        known: String,
    },

    /// A provider was registered twice under the same name
    #[error("provider {0:?} is already registered")]
    DuplicateProvider(String),

    /// Transport-level failure talking to a guest agent
    #[error("connection failed: {0}")]
    Connection(String),

    /// Agent did not respond in time
    #[error("agent timeout after {0:?}")]
    AgentTimeout(std::time::Duration),

    /// JSON-RPC error from agent
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code from the agent
        code: i32,
        /// Error message from the agent
        message: String,
    },

    /// Invalid backend configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error from vmpod-vm
    #[error("VM error: {0}")]
    Vm(#[from] vmpod_vm::VmError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
