//! Error taxonomy for the request pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Exit code reported when the playbook file is missing.
pub const EXIT_PLAYBOOK_NOT_FOUND: i32 = 127;
/// Exit code reported when the tool was stopped by the deadline or by shutdown.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when the tool could not be started.
pub const EXIT_LAUNCH_FAILED: i32 = 1;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid JSON: {0}")]
    MalformedMessage(#[source] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unsupported db_type {db_type:?}")]
    UnsupportedDbType { db_type: String },

    #[error("write inventory file {}: {source}", path.display())]
    InventoryWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("playbook not found at {}: {source}", path.display())]
    PlaybookNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", after.as_secs())]
    ProcessTimeout { program: String, after: Duration },

    #[error("{program} cancelled by worker shutdown")]
    ProcessCancelled { program: String },

    #[error("{program} exited with status {code}")]
    ProcessNonZeroExit { program: String, code: i32 },

    #[error("publish status: {0}")]
    Publish(String),
}

impl ProvisionError {
    /// Stable label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "malformed_message",
            Self::Validation(_) => "validation_error",
            Self::UnsupportedDbType { .. } => "unsupported_db_type",
            Self::InventoryWrite { .. } => "inventory_write_error",
            Self::PlaybookNotFound { .. } => "playbook_not_found",
            Self::ProcessLaunch { .. } => "process_launch_error",
            Self::ProcessTimeout { .. } => "process_timeout",
            Self::ProcessCancelled { .. } => "process_cancelled",
            Self::ProcessNonZeroExit { .. } => "process_nonzero_exit",
            Self::Publish(_) => "publish_error",
        }
    }

    /// Exit code carried into the published status, if the error has one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::PlaybookNotFound { .. } => Some(EXIT_PLAYBOOK_NOT_FOUND),
            Self::ProcessLaunch { .. } => Some(EXIT_LAUNCH_FAILED),
            Self::ProcessTimeout { .. } | Self::ProcessCancelled { .. } => Some(EXIT_TIMEOUT),
            Self::ProcessNonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// First violation found while validating an install request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing id")]
    MissingId,
    #[error("missing name")]
    MissingName,
    #[error("invalid ip_address: {value:?}: {reason}")]
    InvalidIpAddress { value: String, reason: String },
    #[error("missing vm_user or vm_password")]
    MissingVmCredentials,
    #[error("missing db creds or db_name")]
    MissingDbCredentials,
    #[error("{field} must not contain whitespace or control characters")]
    UnsafeCredential { field: &'static str },
    #[error("unsupported db_type {value:?} (supported: {supported})")]
    UnsupportedDbType { value: String, supported: String },
}
