//! Fake collaborators shared by the pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use patchline_core::install_status::InstallOutcome;
use patchline_core::types::{JobIdentity, TargetIdentity};
use patchline_events::bus::{InstallerBus, InstallerEvent};
use patchline_pipeline::services::{
    ApplyError, Installer, InstallerError, PatchApplier, PatchSession, Signer, SignerError,
};
use patchline_pipeline::{PipelineServices, ScratchDir, WorkQueue};
use tempfile::TempDir;
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// Applier
// ---------------------------------------------------------------------------

/// Appends each applied operation id to the source bytes.
///
/// Operations listed in `failing` return an error. When `gate` is set, every
/// operation waits for one permit before completing; `write_gate` does the
/// same for the write step.
#[derive(Default)]
pub struct FakeApplier {
    pub failing: HashSet<String>,
    pub gate: Option<Arc<Semaphore>>,
    pub write_gate: Option<Arc<Semaphore>>,
}

struct FakeSession {
    content: Vec<u8>,
    failing: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    write_gate: Option<Arc<Semaphore>>,
}

async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.expect("gate open").forget();
    }
}

#[async_trait]
impl PatchApplier for FakeApplier {
    async fn open(&self, source: &Path) -> Result<Box<dyn PatchSession>, ApplyError> {
        let content = tokio::fs::read(source).await?;
        Ok(Box::new(FakeSession {
            content,
            failing: self.failing.clone(),
            gate: self.gate.clone(),
            write_gate: self.write_gate.clone(),
        }))
    }
}

#[async_trait]
impl PatchSession for FakeSession {
    async fn apply(&mut self, operation: &str) -> Result<(), ApplyError> {
        pass(&self.gate).await;
        if self.failing.contains(operation) {
            return Err(ApplyError::OperationFailed {
                operation: operation.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.content.extend_from_slice(format!("+{operation}").as_bytes());
        Ok(())
    }

    async fn write(&mut self, output: &Path) -> Result<(), ApplyError> {
        pass(&self.write_gate).await;
        tokio::fs::write(output, &self.content).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// Copies the input and appends a `|signed` marker. Counts calls.
///
/// When `gate` is set, the signer reads its input and then waits for a
/// permit before writing the output.
#[derive(Default)]
pub struct FakeSigner {
    pub calls: AtomicUsize,
    pub fail: bool,
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeSigner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(&self, input: &Path, output: &Path) -> Result<(), SignerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SignerError::KeyUnavailable("test keystore".to_string()));
        }
        let mut content = tokio::fs::read(input).await?;
        pass(&self.gate).await;
        content.extend_from_slice(b"|signed");
        tokio::fs::write(output, content).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Installer
// ---------------------------------------------------------------------------

/// Records hand-offs and optionally publishes an outcome right away.
pub struct FakeInstaller {
    pub bus: Arc<InstallerBus>,
    /// Outcome published on every accepted hand-off.
    pub respond_with: Option<InstallOutcome>,
    /// Rejects every hand-off with this code.
    pub reject_with: Option<i32>,
    /// Each hand-off waits for a permit after being recorded.
    pub gate: Option<Arc<Semaphore>>,
    pub calls: Mutex<Vec<(Vec<PathBuf>, TargetIdentity)>>,
}

impl FakeInstaller {
    pub fn new(bus: Arc<InstallerBus>) -> Self {
        Self {
            bus,
            respond_with: None,
            reject_with: None,
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(Vec<PathBuf>, TargetIdentity)> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(
        &self,
        artifacts: &[PathBuf],
        target: &TargetIdentity,
    ) -> Result<(), InstallerError> {
        self.calls
            .lock()
            .expect("lock")
            .push((artifacts.to_vec(), target.clone()));
        pass(&self.gate).await;

        if let Some(code) = self.reject_with {
            return Err(InstallerError::Rejected {
                code,
                message: "scripted rejection".to_string(),
            });
        }
        if let Some(outcome) = &self.respond_with {
            self.bus.publish(InstallerEvent::install(
                JobIdentity::from(target),
                outcome.clone(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A full set of fake services over a fresh temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub source: PathBuf,
    pub scratch: PathBuf,
    pub signer: Arc<FakeSigner>,
    pub installer: Arc<FakeInstaller>,
    pub bus: Arc<InstallerBus>,
    pub services: PipelineServices,
}

pub struct HarnessBuilder {
    applier: FakeApplier,
    signer: FakeSigner,
    respond_with: Option<InstallOutcome>,
    reject_with: Option<i32>,
    install_gate: Option<Arc<Semaphore>>,
}

impl HarnessBuilder {
    pub fn failing_operation(mut self, operation: &str) -> Self {
        self.applier.failing.insert(operation.to_string());
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.applier.gate = Some(gate);
        self
    }

    pub fn gated_write(mut self, gate: Arc<Semaphore>) -> Self {
        self.applier.write_gate = Some(gate);
        self
    }

    pub fn gated_signer(mut self, gate: Arc<Semaphore>) -> Self {
        self.signer.gate = Some(gate);
        self
    }

    pub fn gated_installer(mut self, gate: Arc<Semaphore>) -> Self {
        self.install_gate = Some(gate);
        self
    }

    pub fn failing_signer(mut self) -> Self {
        self.signer.fail = true;
        self
    }

    pub fn install_outcome(mut self, outcome: InstallOutcome) -> Self {
        self.respond_with = Some(outcome);
        self
    }

    pub fn rejecting_installer(mut self, code: i32) -> Self {
        self.reject_with = Some(code);
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("base.apk");
        std::fs::write(&source, b"base").expect("write source");
        let scratch = dir.path().join("scratch");

        let bus = Arc::new(InstallerBus::default());
        let signer = Arc::new(self.signer);
        let mut installer = FakeInstaller::new(Arc::clone(&bus));
        installer.respond_with = self.respond_with;
        installer.reject_with = self.reject_with;
        installer.gate = self.install_gate;
        let installer = Arc::new(installer);

        let services = PipelineServices {
            queue: Arc::new(WorkQueue::new(Arc::new(self.applier))),
            signer: signer.clone(),
            installer: installer.clone(),
            storage: Arc::new(ScratchDir::new(&scratch)),
            bus: Arc::clone(&bus),
        };

        Harness {
            dir,
            source,
            scratch,
            signer,
            installer,
            bus,
            services,
        }
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        applier: FakeApplier::default(),
        signer: FakeSigner::default(),
        respond_with: None,
        reject_with: None,
        install_gate: None,
    }
}

pub fn target() -> TargetIdentity {
    TargetIdentity::new("com.example.app", "19.16.39")
}

/// Poll `condition` every few milliseconds until it holds or five seconds
/// pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Files currently present in the scratch directory.
pub fn scratch_files(harness: &Harness) -> Vec<PathBuf> {
    match std::fs::read_dir(&harness.scratch) {
        Ok(entries) => entries
            .map(|e| e.expect("dir entry").path())
            .collect(),
        Err(_) => Vec::new(),
    }
}
