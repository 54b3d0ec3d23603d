//! Installer status codes and the install outcome value.
//!
//! Codes follow the platform package installer. Only [`STATUS_SUCCESS`]
//! means the package was installed.

use serde::{Deserialize, Serialize};

/// No outcome has been received yet.
pub const STATUS_UNKNOWN: i32 = -999;

/// The installer is waiting for the user to confirm.
pub const STATUS_PENDING_USER_ACTION: i32 = -1;

pub const STATUS_SUCCESS: i32 = 0;

pub const STATUS_FAILURE: i32 = 1;

pub const STATUS_FAILURE_BLOCKED: i32 = 2;

pub const STATUS_FAILURE_ABORTED: i32 = 3;

pub const STATUS_FAILURE_INVALID: i32 = 4;

pub const STATUS_FAILURE_CONFLICT: i32 = 5;

pub const STATUS_FAILURE_STORAGE: i32 = 6;

pub const STATUS_FAILURE_INCOMPATIBLE: i32 = 7;

/// Short label for an installer status code.
pub fn describe_status(code: i32) -> &'static str {
    match code {
        STATUS_UNKNOWN => "unknown",
        STATUS_PENDING_USER_ACTION => "pending user action",
        STATUS_SUCCESS => "success",
        STATUS_FAILURE => "failure",
        STATUS_FAILURE_BLOCKED => "blocked",
        STATUS_FAILURE_ABORTED => "aborted",
        STATUS_FAILURE_INVALID => "invalid package",
        STATUS_FAILURE_CONFLICT => "conflicts with an installed package",
        STATUS_FAILURE_STORAGE => "insufficient storage",
        STATUS_FAILURE_INCOMPATIBLE => "incompatible with this device",
        _ => "unrecognised status",
    }
}

/// Status code plus human-readable detail reported by the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub code: i32,
    pub message: String,
}

impl InstallOutcome {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }
}

/// Install state of a job as seen by its coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstallStatus {
    /// No install outcome yet (never installed, or hand-off still pending).
    #[default]
    Unknown,
    Succeeded(InstallOutcome),
    Failed(InstallOutcome),
}

impl InstallStatus {
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn outcome(&self) -> Option<&InstallOutcome> {
        match self {
            Self::Unknown => None,
            Self::Succeeded(outcome) | Self::Failed(outcome) => Some(outcome),
        }
    }
}

impl From<InstallOutcome> for InstallStatus {
    fn from(outcome: InstallOutcome) -> Self {
        if outcome.is_success() {
            Self::Succeeded(outcome)
        } else {
            Self::Failed(outcome)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
