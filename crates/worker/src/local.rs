//! Local collaborator implementations.
//!
//! These back the pipeline traits with plain file operations so the worker
//! can drive a full build -> sign -> install cycle on one machine:
//!
//! - [`PassthroughApplier`] validates and records operations but leaves the
//!   artifact bytes unchanged.
//! - [`DigestSigner`] appends a SHA-256 digest of the artifact as a trailer.
//! - [`DirectoryInstaller`] copies the artifact into an install directory
//!   and reports the outcome on the [`InstallerBus`] from a background task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use patchline_core::install_status::{
    InstallOutcome, STATUS_FAILURE_INVALID, STATUS_FAILURE_STORAGE, STATUS_SUCCESS,
};
use patchline_core::types::{JobIdentity, TargetIdentity};
use patchline_events::bus::{InstallerBus, InstallerEvent};
use patchline_pipeline::services::{
    ApplyError, Installer, InstallerError, PatchApplier, PatchSession, Signer, SignerError,
};
use sha2::{Digest, Sha256};

/// Length of the digest trailer written by [`DigestSigner`].
pub const DIGEST_TRAILER_LEN: usize = 32;

// ---------------------------------------------------------------------------
// PassthroughApplier
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughApplier;

struct PassthroughSession {
    content: Vec<u8>,
    applied: Vec<String>,
}

#[async_trait]
impl PatchApplier for PassthroughApplier {
    async fn open(&self, source: &Path) -> Result<Box<dyn PatchSession>, ApplyError> {
        let content = tokio::fs::read(source).await?;
        tracing::debug!(source = %source.display(), bytes = content.len(), "Source artifact loaded");
        Ok(Box::new(PassthroughSession {
            content,
            applied: Vec::new(),
        }))
    }
}

#[async_trait]
impl PatchSession for PassthroughSession {
    async fn apply(&mut self, operation: &str) -> Result<(), ApplyError> {
        if operation.is_empty() || operation.chars().any(char::is_whitespace) {
            return Err(ApplyError::UnknownOperation(operation.to_string()));
        }
        self.applied.push(operation.to_string());
        Ok(())
    }

    async fn write(&mut self, output: &Path) -> Result<(), ApplyError> {
        tokio::fs::write(output, &self.content).await?;
        tracing::debug!(
            output = %output.display(),
            operations = ?self.applied,
            "Output artifact written",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DigestSigner
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct DigestSigner;

impl DigestSigner {
    /// Check that `signed` ends with the digest of the bytes before it.
    pub fn verify(signed: &[u8]) -> bool {
        if signed.len() < DIGEST_TRAILER_LEN {
            return false;
        }
        let (body, trailer) = signed.split_at(signed.len() - DIGEST_TRAILER_LEN);
        Sha256::digest(body).as_slice() == trailer
    }
}

#[async_trait]
impl Signer for DigestSigner {
    async fn sign(&self, input: &Path, output: &Path) -> Result<(), SignerError> {
        let mut content = tokio::fs::read(input).await?;
        if content.is_empty() {
            return Err(SignerError::Failed(format!(
                "{} is empty",
                input.display()
            )));
        }

        let digest = Sha256::digest(&content);
        tracing::debug!(input = %input.display(), digest = %format!("{digest:x}"), "Artifact digest");
        content.extend_from_slice(&digest);
        tokio::fs::write(output, content).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DirectoryInstaller
// ---------------------------------------------------------------------------

/// Installs by copying the first artifact to `<dir>/<name>-<version>`.
pub struct DirectoryInstaller {
    dir: PathBuf,
    bus: Arc<InstallerBus>,
}

impl DirectoryInstaller {
    pub fn new(dir: impl Into<PathBuf>, bus: Arc<InstallerBus>) -> Self {
        Self {
            dir: dir.into(),
            bus,
        }
    }

    /// Location an artifact for `target` is installed to.
    pub fn install_path(&self, target: &TargetIdentity) -> PathBuf {
        self.dir.join(format!("{}-{}", target.name, target.version))
    }
}

#[async_trait]
impl Installer for DirectoryInstaller {
    async fn install(
        &self,
        artifacts: &[PathBuf],
        target: &TargetIdentity,
    ) -> Result<(), InstallerError> {
        let Some(artifact) = artifacts.first() else {
            return Err(InstallerError::Rejected {
                code: STATUS_FAILURE_INVALID,
                message: "no artifacts to install".to_string(),
            });
        };
        if !tokio::fs::try_exists(artifact).await? {
            return Err(InstallerError::Rejected {
                code: STATUS_FAILURE_INVALID,
                message: format!("{} does not exist", artifact.display()),
            });
        }

        let artifact = artifact.clone();
        let destination = self.install_path(target);
        let dir = self.dir.clone();
        let identity = JobIdentity::from(target);
        let bus = Arc::clone(&self.bus);

        tokio::spawn(async move {
            let copied = async {
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::copy(&artifact, &destination).await
            }
            .await;

            let outcome = match copied {
                Ok(bytes) => {
                    tracing::info!(
                        identity = %identity,
                        destination = %destination.display(),
                        bytes,
                        "Artifact installed",
                    );
                    InstallOutcome::new(
                        STATUS_SUCCESS,
                        format!("Installed to {}", destination.display()),
                    )
                }
                Err(e) => {
                    tracing::error!(identity = %identity, error = %e, "Install copy failed");
                    InstallOutcome::new(STATUS_FAILURE_STORAGE, e.to_string())
                }
            };
            bus.publish(InstallerEvent::install(identity, outcome));
        });

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
