//! Drives one job through the pipeline using the local collaborators.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use patchline_core::install_status::{describe_status, InstallStatus};
use patchline_core::progress::ProgressSnapshot;
use patchline_events::bus::InstallerBus;
use patchline_pipeline::{
    Coordinator, PipelineServices, ProgressEvent, ScratchDir, TerminalStatus, WorkQueue,
};

use crate::config::WorkerConfig;
use crate::local::{DigestSigner, DirectoryInstaller, PassthroughApplier};

/// How long to wait for an install outcome after the hand-off.
pub const INSTALL_OUTCOME_TIMEOUT: Duration = Duration::from_secs(60);

/// What a finished job produced.
#[derive(Debug)]
pub struct JobReport {
    pub exported_bytes: Option<u64>,
    pub install: Option<InstallStatus>,
}

/// Pipeline services backed by the local collaborators.
pub fn local_services(config: &WorkerConfig) -> PipelineServices {
    let bus = Arc::new(InstallerBus::new(config.event_capacity));
    PipelineServices {
        queue: Arc::new(WorkQueue::new(Arc::new(PassthroughApplier))),
        signer: Arc::new(DigestSigner),
        installer: Arc::new(DirectoryInstaller::new(
            &config.install_dir,
            Arc::clone(&bus),
        )),
        storage: Arc::new(ScratchDir::new(config.work_dir.join("scratch"))),
        bus,
    }
}

/// Submit the configured job, wait for the build, then export and install
/// as configured. The coordinator is disposed before returning.
pub async fn run_job(
    config: &WorkerConfig,
    services: PipelineServices,
    outcome_timeout: Duration,
) -> anyhow::Result<JobReport> {
    let source = config.source()?;
    let target = config.target()?;

    let coordinator =
        Coordinator::submit(services, source, config.operations.iter().cloned(), target)
            .context("Failed to submit job")?;

    let result = drive(&coordinator, config, outcome_timeout).await;
    coordinator.dispose();
    result
}

async fn drive(
    coordinator: &Coordinator,
    config: &WorkerConfig,
    outcome_timeout: Duration,
) -> anyhow::Result<JobReport> {
    if let TerminalStatus::Failed(e) = wait_for_build(coordinator).await? {
        return Err(anyhow::Error::new(e).context("Build failed"));
    }

    let exported_bytes = match &config.export_to {
        Some(destination) => Some(coordinator.export(destination).await.context("Export failed")?),
        None => None,
    };

    let install = if config.install {
        coordinator.install().await.context("Install failed")?;

        let mut rx = coordinator.watch_install_status();
        let status = tokio::time::timeout(outcome_timeout, rx.wait_for(InstallStatus::is_known))
            .await
            .context("Timed out waiting for the install outcome")?
            .context("Install outcome channel closed")?
            .clone();

        if let InstallStatus::Failed(outcome) = &status {
            anyhow::bail!(
                "Install failed with status {} ({}): {}",
                outcome.code,
                describe_status(outcome.code),
                outcome.message
            );
        }
        Some(status)
    } else {
        None
    };

    Ok(JobReport {
        exported_bytes,
        install,
    })
}

/// Follow the job's progress feed until the build ends, logging each step
/// transition.
async fn wait_for_build(coordinator: &Coordinator) -> anyhow::Result<TerminalStatus> {
    let mut subscription = coordinator.subscribe();
    let mut previous: Option<ProgressSnapshot> = None;

    while let Some(event) = subscription.next_event().await {
        match event {
            ProgressEvent::Snapshot(snapshot) => {
                log_snapshot(coordinator, previous.as_ref(), &snapshot);
                previous = Some(snapshot);
            }
            ProgressEvent::Finished(status) => return Ok(status),
        }
    }
    anyhow::bail!("Progress feed closed before the build finished")
}

fn log_snapshot(
    coordinator: &Coordinator,
    previous: Option<&ProgressSnapshot>,
    snapshot: &ProgressSnapshot,
) {
    let changed = match previous {
        Some(previous) => snapshot.changed_since(previous),
        None => snapshot.steps().map(|(key, _)| key).collect(),
    };

    for key in changed {
        if let Some(step) = snapshot.step(&key) {
            tracing::info!(
                identity = %coordinator.identity(),
                group = %key.group,
                step = %key.step,
                status = ?step.status,
                message = step.message.as_deref().unwrap_or(""),
                "Step progress",
            );
        }
    }

    if tracing::enabled!(tracing::Level::TRACE) {
        match serde_json::to_string(snapshot) {
            Ok(json) => tracing::trace!(snapshot = %json, "Progress snapshot"),
            Err(e) => tracing::trace!(error = %e, "Progress snapshot not serializable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
