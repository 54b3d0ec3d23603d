//! Error types for job validation and the pipeline stages.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failure kinds produced by the pipeline.
///
/// Build failures and cancellation end a run; every other variant is
/// reported to the caller of a single export/install request and may be
/// retried once the cause is fixed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// A build step failed. Terminal for the run.
    #[error("Step '{step}' failed: {cause}")]
    BuildStepFailure { step: String, cause: String },

    #[error("Signing failed: {cause}")]
    SignFailure { cause: String },

    #[error("Export failed: {cause}")]
    ExportFailure { cause: String },

    #[error("Install failed with status {code}: {message}")]
    InstallFailure { code: i32, message: String },

    /// The run was cancelled before it finished. Terminal for the run, kept
    /// apart from [`PipelineError::BuildStepFailure`] so callers can tell a
    /// user cancel from an error.
    #[error("Cancellation requested")]
    CancellationRequested,

    /// Export or install was requested before the build succeeded.
    #[error("Build has not succeeded")]
    NotReady,

    /// Another install request for the same job is still outstanding.
    #[error("An install is already in progress")]
    InstallInProgress,

    /// The coordinator was disposed and its artifacts deleted.
    #[error("Coordinator has been disposed")]
    Disposed,
}

impl PipelineError {
    /// Whether the caller may re-issue the failed request.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::BuildStepFailure { .. } | Self::CancellationRequested | Self::Disposed
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancellationRequested)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
