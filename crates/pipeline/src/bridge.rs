//! Correlates installer outcome events with the job that asked for them.
//!
//! An [`InstallOutcomeBridge`] subscribes to the [`InstallerBus`] when it is
//! registered and listens on a background task until it is deregistered.
//! Only install events carrying the bridge's job identity are considered,
//! and only while an install hand-off is awaiting its outcome. The first
//! such event settles the install status; anything after it is ignored
//! until the next install request.
//!
//! Uninstall outcomes are logged and produce no state change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use patchline_core::install_status::{
    describe_status, InstallStatus, STATUS_PENDING_USER_ACTION,
};
use patchline_core::types::JobIdentity;
use patchline_events::bus::{InstallerAction, InstallerBus, InstallerEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct BridgeState {
    identity: JobIdentity,
    status: watch::Sender<InstallStatus>,
    /// Set while an install hand-off is waiting for its outcome.
    awaiting: AtomicBool,
}

impl BridgeState {
    fn handle(&self, event: InstallerEvent) {
        if event.identity != self.identity {
            tracing::trace!(
                identity = %self.identity,
                other = %event.identity,
                "Ignoring installer event for another job",
            );
            return;
        }

        match event.action {
            InstallerAction::Install => {
                if event.outcome.code == STATUS_PENDING_USER_ACTION {
                    tracing::info!(identity = %self.identity, "Install waiting for user action");
                    return;
                }
                if !self.awaiting.swap(false, Ordering::AcqRel) {
                    tracing::debug!(
                        identity = %self.identity,
                        code = event.outcome.code,
                        "Uncorrelated install outcome ignored",
                    );
                    return;
                }

                tracing::info!(
                    identity = %self.identity,
                    code = event.outcome.code,
                    status = describe_status(event.outcome.code),
                    message = %event.outcome.message,
                    "Install outcome received",
                );
                self.status.send_replace(InstallStatus::from(event.outcome));
            }
            InstallerAction::Uninstall => {
                tracing::debug!(
                    identity = %self.identity,
                    code = event.outcome.code,
                    "Uninstall outcome observed",
                );
            }
        }
    }
}

struct Registration {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Install outcome listener for one job.
pub struct InstallOutcomeBridge {
    state: Arc<BridgeState>,
    registration: Mutex<Option<Registration>>,
}

impl InstallOutcomeBridge {
    /// Subscribe to `bus` for outcomes of `identity`.
    ///
    /// The bus subscription exists when this returns, so events published
    /// afterwards are never missed. Must be called within a Tokio runtime.
    pub fn register(bus: &InstallerBus, identity: JobIdentity) -> Self {
        let receiver = bus.subscribe();
        let (status, _) = watch::channel(InstallStatus::Unknown);
        let state = Arc::new(BridgeState {
            identity,
            status,
            awaiting: AtomicBool::new(false),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(
            Arc::clone(&state),
            receiver,
            cancel.clone(),
        ));

        tracing::debug!(identity = %state.identity, "Install outcome bridge registered");

        Self {
            state,
            registration: Mutex::new(Some(Registration { cancel, task })),
        }
    }

    /// Mark that an install hand-off is about to happen. Resets the status
    /// to [`InstallStatus::Unknown`] until its outcome arrives.
    pub fn expect_outcome(&self) {
        self.state.status.send_replace(InstallStatus::Unknown);
        self.state.awaiting.store(true, Ordering::Release);
    }

    /// Stop waiting for an outcome (the hand-off itself failed).
    pub fn abandon_outcome(&self) {
        self.state.awaiting.store(false, Ordering::Release);
    }

    pub fn is_awaiting(&self) -> bool {
        self.state.awaiting.load(Ordering::Acquire)
    }

    pub fn status(&self) -> InstallStatus {
        self.state.status.borrow().clone()
    }

    /// Receiver that observes every install status change.
    pub fn watch(&self) -> watch::Receiver<InstallStatus> {
        self.state.status.subscribe()
    }

    pub fn is_registered(&self) -> bool {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop listening. Only the first call does anything; returns whether
    /// this call deregistered.
    pub fn deregister(&self) -> bool {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match registration {
            Some(Registration { cancel, task }) => {
                cancel.cancel();
                task.abort();
                tracing::debug!(identity = %self.state.identity, "Install outcome bridge deregistered");
                true
            }
            None => false,
        }
    }
}

impl Drop for InstallOutcomeBridge {
    fn drop(&mut self) {
        self.deregister();
    }
}

async fn listen(
    state: Arc<BridgeState>,
    mut receiver: broadcast::Receiver<InstallerEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(event) => state.handle(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        identity = %state.identity,
                        skipped = n,
                        "Install outcome bridge lagged, some events were missed",
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!(identity = %state.identity, "Installer bus closed");
                    break;
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
