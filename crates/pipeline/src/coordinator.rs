//! Single-job coordinator.
//!
//! A [`Coordinator`] owns one job from submission to disposal:
//!
//! 1. On [`Coordinator::submit`] it reserves its two temporary files (build
//!    output and signed artifact), registers the install outcome bridge and
//!    enqueues the build on the shared [`WorkQueue`].
//! 2. Progress is read via [`Coordinator::snapshot`] or pushed via
//!    [`Coordinator::subscribe`].
//! 3. After a successful build, [`Coordinator::export`] and
//!    [`Coordinator::install`] sign on demand (once per coordinator) and then
//!    copy or hand off the signed artifact. Their failures go back to the
//!    caller and leave the build status untouched.
//! 4. [`Coordinator::dispose`] (also run on drop) cancels the execution,
//!    drops observer subscriptions, deregisters the bridge and deletes both
//!    temporary files. Each action is attempted regardless of the others.
//!    A build output still being written is deleted again once the execution
//!    ends, and a signature that completes after disposal is discarded.
//!
//! A coordinator that attached to another submission's execution does not
//! own the build output; it only reads it and never deletes it.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use patchline_core::error::{CoreError, PipelineError};
use patchline_core::install_status::{InstallStatus, STATUS_FAILURE};
use patchline_core::progress::{ProgressModel, ProgressSnapshot};
use patchline_core::types::{JobIdentity, JobSpec, TargetIdentity};
use patchline_events::bus::InstallerBus;
use tokio::sync::{watch, OnceCell};
use uuid::Uuid;

use crate::bridge::InstallOutcomeBridge;
use crate::feed::{ProgressSubscription, SubscriptionId};
use crate::panic::panic_message;
use crate::queue::{JobHandle, JobStatus, WorkQueue};
use crate::services::{Installer, Signer, TempStorage};

/// Collaborators shared by every coordinator in the process.
#[derive(Clone)]
pub struct PipelineServices {
    pub queue: Arc<WorkQueue>,
    pub signer: Arc<dyn Signer>,
    pub installer: Arc<dyn Installer>,
    pub storage: Arc<dyn TempStorage>,
    pub bus: Arc<InstallerBus>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Failed to reserve temporary file: {0}")]
    Storage(#[from] std::io::Error),
}

/// Resets the installing flag when an install call ends, however it ends.
struct InstallingGuard<'a>(&'a AtomicBool);

impl Drop for InstallingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of one build job and its artifacts.
pub struct Coordinator {
    handle: JobHandle,
    model: ProgressModel,
    services: PipelineServices,
    output_file: PathBuf,
    /// False when attached: the output belongs to the first submitter.
    owns_output: bool,
    signed_file: PathBuf,
    signed: OnceCell<()>,
    installing: AtomicBool,
    bridge: InstallOutcomeBridge,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    disposed: AtomicBool,
}

impl Coordinator {
    /// Submit a job for `target`, applying `operations` to `source`.
    ///
    /// If a build for the same target identity is already active, the new
    /// coordinator attaches to it instead of starting another one.
    /// Must be called within a Tokio runtime.
    pub fn submit<I, S>(
        services: PipelineServices,
        source: impl Into<PathBuf>,
        operations: I,
        target: TargetIdentity,
    ) -> Result<Self, CoordinatorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        target.validate()?;
        let identity = JobIdentity::from(&target);

        let scope = Uuid::new_v4().simple().to_string();
        let output_file = services
            .storage
            .create(&format!("{}-{scope}-output", target.name))?;
        let signed_file = match services
            .storage
            .create(&format!("{}-{scope}-signed", target.name))
        {
            Ok(path) => path,
            Err(e) => {
                let _ = services.storage.delete(&output_file);
                return Err(e.into());
            }
        };

        let spec = JobSpec::new(source, output_file.clone(), operations, target);
        let enqueued = spec
            .validate()
            .and_then(|()| services.queue.enqueue_unique(identity.clone(), spec));
        let handle = match enqueued {
            Ok(handle) => handle,
            Err(e) => {
                let _ = services.storage.delete(&output_file);
                let _ = services.storage.delete(&signed_file);
                return Err(e.into());
            }
        };

        // An attached job builds into the running execution's output, so the
        // reservation made for this submission is never used.
        let owns_output = !handle.is_attached();
        if !owns_output {
            if let Err(e) = services.storage.delete(&output_file) {
                tracing::warn!(
                    path = %output_file.display(),
                    error = %e,
                    "Failed to release unused output reservation",
                );
            }
        }
        let output_file = handle.spec().output().to_path_buf();

        // Nothing can request an install before this coordinator is returned,
        // so the bridge is listening before any outcome can be produced.
        let bridge = InstallOutcomeBridge::register(&services.bus, identity);
        let model = ProgressModel::for_spec(handle.spec());

        tracing::info!(
            identity = %handle.identity(),
            execution_id = %handle.execution_id(),
            attached = handle.is_attached(),
            "Coordinator created",
        );

        Ok(Self {
            handle,
            model,
            services,
            output_file,
            owns_output,
            signed_file,
            signed: OnceCell::new(),
            installing: AtomicBool::new(false),
            bridge,
            subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &JobIdentity {
        self.handle.identity()
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Build output read by signing. For an attached coordinator this is
    /// the running execution's output, which this coordinator does not own.
    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    pub fn signed_file(&self) -> &Path {
        &self.signed_file
    }

    /// Latest progress; every step Pending before the first report.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.handle
            .feed()
            .latest()
            .unwrap_or_else(|| self.model.initial())
    }

    pub fn build_status(&self) -> JobStatus {
        self.handle.status()
    }

    /// Subscribe to progress of this job's execution.
    pub fn subscribe(&self) -> ProgressSubscription {
        let subscription = self.handle.subscribe();
        let feed = self.handle.feed();
        let mut ids = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ids.retain(|id| feed.is_subscribed(*id));
        ids.push(subscription.id());
        subscription
    }

    /// Number of subscriptions handed out by this coordinator that are
    /// still tracked for release on disposal.
    pub fn tracked_subscriptions(&self) -> usize {
        let feed = self.handle.feed();
        let mut ids = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ids.retain(|id| feed.is_subscribed(*id));
        ids.len()
    }

    /// True iff the build succeeded and no install call is outstanding.
    pub fn can_install(&self) -> bool {
        !self.is_disposed()
            && self.build_status() == JobStatus::Succeeded
            && !self.installing.load(Ordering::Acquire)
    }

    pub fn install_status(&self) -> InstallStatus {
        self.bridge.status()
    }

    pub fn watch_install_status(&self) -> watch::Receiver<InstallStatus> {
        self.bridge.watch()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Sign if needed, then copy the signed artifact to `destination`.
    ///
    /// Returns the number of bytes written.
    pub async fn export(&self, destination: &Path) -> Result<u64, PipelineError> {
        self.ensure_signed().await?;

        match tokio::fs::copy(&self.signed_file, destination).await {
            Ok(bytes) => {
                tracing::info!(
                    identity = %self.identity(),
                    destination = %destination.display(),
                    bytes,
                    "Exported signed artifact",
                );
                Ok(bytes)
            }
            Err(e) => {
                tracing::warn!(
                    identity = %self.identity(),
                    destination = %destination.display(),
                    error = %e,
                    "Export failed",
                );
                Err(PipelineError::ExportFailure {
                    cause: e.to_string(),
                })
            }
        }
    }

    /// Sign if needed, then hand the signed artifact to the installer.
    ///
    /// A successful return means the installer accepted the hand-off; the
    /// outcome arrives later through [`Coordinator::install_status`].
    pub async fn install(&self) -> Result<(), PipelineError> {
        if self.is_disposed() {
            return Err(PipelineError::Disposed);
        }
        if self.build_status() != JobStatus::Succeeded {
            return Err(PipelineError::NotReady);
        }
        if self
            .installing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::InstallInProgress);
        }
        let _guard = InstallingGuard(&self.installing);

        self.ensure_signed().await?;

        self.bridge.expect_outcome();
        let artifacts = [self.signed_file.clone()];
        let result = AssertUnwindSafe(
            self.services
                .installer
                .install(&artifacts, self.handle.spec().target()),
        )
        .catch_unwind()
        .await;

        let err = match result {
            Ok(Ok(())) => {
                tracing::info!(identity = %self.identity(), "Install handed off");
                return Ok(());
            }
            Ok(Err(e)) => PipelineError::from(e),
            Err(panic) => PipelineError::InstallFailure {
                code: STATUS_FAILURE,
                message: format!("installer panicked: {}", panic_message(panic)),
            },
        };

        self.bridge.abandon_outcome();
        tracing::warn!(identity = %self.identity(), error = %err, "Install hand-off failed");
        Err(err)
    }

    /// Release everything this coordinator owns. Safe to call repeatedly.
    pub fn dispose(&self) {
        // SeqCst: pairs with the post-sign check in `ensure_signed`.
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(identity = %self.identity(), "Disposing coordinator");

        self.handle.cancel();

        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in subscriptions {
            self.handle.feed().unsubscribe(id);
        }

        self.bridge.deregister();

        self.delete_temp(&self.signed_file);
        if self.owns_output {
            self.delete_temp(&self.output_file);
            if self.handle.terminal().is_none() {
                self.delete_output_when_finished();
            }
        }
    }

    fn delete_temp(&self, path: &Path) {
        if let Err(e) = self.services.storage.delete(path) {
            tracing::warn!(
                identity = %self.identity(),
                path = %path.display(),
                error = %e,
                "Failed to delete temporary file",
            );
        }
    }

    /// The write step may still recreate the output after disposal; delete
    /// it again once the execution has reached its terminal status.
    fn delete_output_when_finished(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                identity = %self.identity(),
                path = %self.output_file.display(),
                "No runtime for deferred cleanup, output may outlive the build",
            );
            return;
        };

        let subscription = self.handle.subscribe();
        let storage = Arc::clone(&self.services.storage);
        let path = self.output_file.clone();
        let identity = self.identity().clone();
        runtime.spawn(async move {
            subscription.finished().await;
            match storage.delete(&path) {
                Ok(()) => tracing::debug!(
                    identity = %identity,
                    path = %path.display(),
                    "Deleted build output after execution ended",
                ),
                Err(e) => tracing::warn!(
                    identity = %identity,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete temporary file",
                ),
            }
        });
    }

    /// Sign the build output once; later calls reuse the signed artifact.
    /// A failed attempt leaves nothing cached, so the next call retries.
    async fn ensure_signed(&self) -> Result<(), PipelineError> {
        if self.is_disposed() {
            return Err(PipelineError::Disposed);
        }
        if self.build_status() != JobStatus::Succeeded {
            return Err(PipelineError::NotReady);
        }

        self.signed
            .get_or_try_init(|| async {
                let input = self.handle.spec().output();
                tracing::info!(
                    identity = %self.identity(),
                    input = %input.display(),
                    "Signing build output",
                );

                let result = AssertUnwindSafe(self.services.signer.sign(input, &self.signed_file))
                    .catch_unwind()
                    .await;

                if self.is_disposed() {
                    tracing::info!(identity = %self.identity(), "Disposed while signing, discarding signature");
                    self.delete_temp(&self.signed_file);
                    return Err(PipelineError::Disposed);
                }

                let cause = match result {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => e.to_string(),
                    Err(panic) => format!("signer panicked: {}", panic_message(panic)),
                };
                tracing::warn!(identity = %self.identity(), cause = %cause, "Signing failed");
                Err(PipelineError::SignFailure { cause })
            })
            .await
            .map(|_| ())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}
