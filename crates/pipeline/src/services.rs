//! Collaborator interfaces consumed by the pipeline.
//!
//! The patch algorithm, the signing scheme, the platform installer and the
//! file system are all external to the coordinator. Each is reached through
//! one of the traits below so it can be swapped for a local or fake
//! implementation.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use patchline_core::error::PipelineError;
use patchline_core::install_status::STATUS_FAILURE;
use patchline_core::types::TargetIdentity;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation '{operation}' failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("Source artifact has not been loaded")]
    NotLoaded,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Signing failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum InstallerError {
    /// The installer refused the hand-off.
    #[error("Installer rejected the request ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<InstallerError> for PipelineError {
    fn from(err: InstallerError) -> Self {
        match err {
            InstallerError::Rejected { code, message } => {
                PipelineError::InstallFailure { code, message }
            }
            InstallerError::Io(e) => PipelineError::InstallFailure {
                code: STATUS_FAILURE,
                message: e.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Applies selected operations to a source artifact.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    /// Load the source artifact and start a patch session.
    async fn open(&self, source: &Path) -> Result<Box<dyn PatchSession>, ApplyError>;
}

/// One in-progress patch of a loaded artifact.
#[async_trait]
pub trait PatchSession: Send {
    async fn apply(&mut self, operation: &str) -> Result<(), ApplyError>;

    /// Write the patched artifact to `output`.
    async fn write(&mut self, output: &Path) -> Result<(), ApplyError>;
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `input`, writing the signed artifact to `output`.
    async fn sign(&self, input: &Path, output: &Path) -> Result<(), SignerError>;
}

/// Hands signed artifacts to the platform installer.
///
/// A successful return only means the hand-off was accepted. The outcome
/// arrives later as an
/// [`InstallerEvent`](patchline_events::bus::InstallerEvent) on the
/// installer bus.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(
        &self,
        artifacts: &[PathBuf],
        target: &TargetIdentity,
    ) -> Result<(), InstallerError>;
}

/// Scoped temporary files.
pub trait TempStorage: Send + Sync {
    /// Reserve the path for temporary file `name`, removing any stale file
    /// already there.
    fn create(&self, name: &str) -> io::Result<PathBuf>;

    /// Delete a file previously returned by [`TempStorage::create`].
    /// Deleting a file that does not exist succeeds.
    fn delete(&self, path: &Path) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
