//! Error type shared by the runner, probes, adapters and the controller.

use thiserror::Error;

use crate::providers::RunState;

/// Errors that can occur while managing a VM.
#[derive(Error, Debug)]
pub enum VmError {
    /// Provider CLI (or `ping`/`ssh`) is not installed or not on `PATH`.
    #[error("Required tool not found: {0}")]
    ToolingMissing(String),

    /// Provider CLI exited non-zero with a decodable reason.
    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),

    /// Provider reply could not be decoded.
    #[error("Malformed provider response: {message}")]
    MalformedResponse { message: String, body: String },

    /// A bounded poll exceeded its ceiling.
    #[error("Timed out waiting for {operation} after {elapsed_secs} seconds")]
    Timeout { operation: String, elapsed_secs: u64 },

    /// Provider reply contradicts the locally recorded descriptor.
    #[error("Integrity mismatch on {field}: expected '{expected}', provider reports '{actual}'")]
    IntegrityMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// No VM id is recorded for this provider.
    #[error("No {0} VM currently defined")]
    NoVmDefined(String),

    /// A VM id is already recorded.
    #[error("Instance '{0}' already exists, run 'delete' first, or 'clean' if the state is stale")]
    AlreadyExists(String),

    /// SSH key file was not found.
    #[error("Could not find key file '{0}'")]
    KeyFileMissing(String),

    /// Operation is not allowed from the current run state.
    #[error("Cannot {operation}: instance is {state}")]
    InvalidState { operation: String, state: RunState },

    /// Provider did not enter its transient stopping state after a stop request.
    #[error("Asked VM to stop, but status is {0}")]
    StopNotHonored(RunState),

    /// Provider network policy does not permit ICMP.
    #[error("'{0}' does not currently support ping")]
    NotPingable(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmError {
    /// Build a [`VmError::MalformedResponse`] from a decode failure and the raw body.
    pub fn malformed(err: &serde_json::Error, body: &str) -> Self {
        Self::MalformedResponse {
            message: err.to_string(),
            body: body.to_string(),
        }
    }

    /// Whether the error is a poll timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
