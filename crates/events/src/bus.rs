//! In-process installer event bus backed by a `tokio::sync::broadcast` channel.
//!
//! Installer services publish an [`InstallerEvent`] when an install or
//! uninstall finishes. Coordinators subscribe for the lifetime of their job
//! and pick out the events that carry their identity.

use chrono::{DateTime, Utc};
use patchline_core::install_status::InstallOutcome;
use patchline_core::types::JobIdentity;
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// InstallerEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerAction {
    Install,
    Uninstall,
}

/// Outcome notification from the installer.
#[derive(Debug, Clone, Serialize)]
pub struct InstallerEvent {
    pub action: InstallerAction,

    /// Identity of the package the outcome refers to.
    pub identity: JobIdentity,

    pub outcome: InstallOutcome,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl InstallerEvent {
    pub fn install(identity: JobIdentity, outcome: InstallOutcome) -> Self {
        Self::new(InstallerAction::Install, identity, outcome)
    }

    pub fn uninstall(identity: JobIdentity, outcome: InstallOutcome) -> Self {
        Self::new(InstallerAction::Uninstall, identity, outcome)
    }

    fn new(action: InstallerAction, identity: JobIdentity, outcome: InstallOutcome) -> Self {
        Self {
            action,
            identity,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// InstallerBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out bus for installer outcomes.
///
/// # Usage
///
/// ```rust
/// use patchline_core::install_status::{InstallOutcome, STATUS_SUCCESS};
/// use patchline_core::types::{JobIdentity, TargetIdentity};
/// use patchline_events::bus::{InstallerBus, InstallerEvent};
///
/// let bus = InstallerBus::default();
/// let mut rx = bus.subscribe();
///
/// let identity = JobIdentity::from(&TargetIdentity::new("com.example", "1.0"));
/// bus.publish(InstallerEvent::install(identity, InstallOutcome::new(STATUS_SUCCESS, "")));
/// ```
pub struct InstallerBus {
    sender: broadcast::Sender<InstallerEvent>,
}

impl InstallerBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is dropped.
    pub fn publish(&self, event: InstallerEvent) {
        tracing::debug!(
            action = ?event.action,
            identity = %event.identity,
            code = event.outcome.code,
            "Installer event published",
        );
        // Ignore the SendError: it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstallerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InstallerBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
