//! Push subscription for the progress of one execution.
//!
//! A [`ProgressFeed`] keeps the latest [`ProgressSnapshot`] and a registry of
//! subscriber channels. Subscribing replays the latest snapshot (and the
//! terminal status, if the run already ended) and then delivers every later
//! snapshot in order. Exactly one terminal status is delivered per run;
//! after it the subscriber channels are closed.
//!
//! Dropping or unsubscribing a [`ProgressSubscription`] never affects the
//! executor that publishes into the feed.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use patchline_core::error::PipelineError;
use patchline_core::progress::ProgressSnapshot;
use tokio::sync::mpsc;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed(PipelineError),
}

impl TerminalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            Self::Succeeded => None,
            Self::Failed(err) => Some(err),
        }
    }
}

/// Item delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Snapshot(ProgressSnapshot),
    /// Always the last item of a subscription.
    Finished(TerminalStatus),
}

pub type SubscriptionId = u64;

type FeedSender = mpsc::UnboundedSender<ProgressEvent>;

#[derive(Default)]
struct FeedState {
    latest: Option<ProgressSnapshot>,
    terminal: Option<TerminalStatus>,
    subscribers: HashMap<SubscriptionId, FeedSender>,
    next_id: SubscriptionId,
}

/// Snapshot and terminal-status fan-out for one execution.
#[derive(Default)]
pub struct ProgressFeed {
    state: Mutex<FeedState>,
}

impl ProgressFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the latest snapshot and push it to every subscriber.
    ///
    /// Returns `false` (and delivers nothing) once the run has finished, or
    /// when `snapshot` would move a step backwards.
    pub fn publish(&self, snapshot: ProgressSnapshot) -> bool {
        let mut state = self.lock();
        if state.terminal.is_some() {
            tracing::warn!("Snapshot published after terminal status, dropped");
            return false;
        }
        if let Some(previous) = &state.latest {
            if snapshot.regresses(previous) {
                tracing::warn!("Regressing snapshot dropped");
                return false;
            }
        }

        state
            .subscribers
            .retain(|_, tx| tx.send(ProgressEvent::Snapshot(snapshot.clone())).is_ok());
        state.latest = Some(snapshot);
        true
    }

    /// Record the terminal status, deliver it, and close every subscription.
    ///
    /// Only the first call has any effect; returns whether this call won.
    pub fn finish(&self, status: TerminalStatus) -> bool {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return false;
        }

        for (_, tx) in state.subscribers.drain() {
            let _ = tx.send(ProgressEvent::Finished(status.clone()));
        }
        state.terminal = Some(status);
        true
    }

    /// Subscribe to this feed.
    pub fn subscribe(self: &Arc<Self>) -> ProgressSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let id = state.next_id;
        state.next_id += 1;

        if let Some(snapshot) = &state.latest {
            let _ = tx.send(ProgressEvent::Snapshot(snapshot.clone()));
        }
        match &state.terminal {
            // Sender is dropped here, so the subscription ends after replay.
            Some(status) => {
                let _ = tx.send(ProgressEvent::Finished(status.clone()));
            }
            None => {
                state.subscribers.insert(id, tx);
            }
        }

        ProgressSubscription {
            id,
            feed: Arc::downgrade(self),
            rx,
        }
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    /// Whether `id` still receives events.
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.contains_key(&id)
    }

    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.lock().latest.clone()
    }

    pub fn terminal(&self) -> Option<TerminalStatus> {
        self.lock().terminal.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Receiving side of a feed subscription.
///
/// Also usable as a [`Stream`] of [`ProgressEvent`]s.
pub struct ProgressSubscription {
    id: SubscriptionId,
    feed: Weak<ProgressFeed>,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Wait for the terminal status, skipping snapshots.
    pub async fn finished(mut self) -> Option<TerminalStatus> {
        while let Some(event) = self.rx.recv().await {
            if let ProgressEvent::Finished(status) = event {
                return Some(status);
            }
        }
        None
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Stream for ProgressSubscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.unsubscribe(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
