//! Identity-keyed work queue with at-most-one active execution per identity.
//!
//! [`WorkQueue::enqueue_unique`] either starts a new execution for a job
//! identity or, while one is still active, returns a handle attached to it
//! and discards the new spec. Check-and-insert for an identity runs under the
//! table's per-shard write lock, so concurrent submissions for the same
//! identity serialize.
//!
//! Finished executions stay in the table only until the next submission or
//! [`WorkQueue::active_identities`] call prunes them; handles already given
//! out keep their execution alive.
//!
//! The queue is an ordinary value shared via `Arc<WorkQueue>`; there is no
//! global registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use patchline_core::error::CoreError;
use patchline_core::types::{JobIdentity, JobSpec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::JobExecutor;
use crate::feed::{ProgressFeed, ProgressSubscription, TerminalStatus};
use crate::services::PatchApplier;

/// Coarse status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued, not yet picked up by the runtime.
    Unknown,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of the build stage.
pub struct Execution {
    id: Uuid,
    identity: JobIdentity,
    spec: JobSpec,
    /// JSON-encoded spec handed to the executor.
    payload: String,
    feed: Arc<ProgressFeed>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Execution {
    fn new(identity: JobIdentity, spec: JobSpec) -> Result<Self, CoreError> {
        let payload = spec.to_payload()?;
        Ok(Self {
            id: Uuid::new_v4(),
            identity,
            spec,
            payload,
            feed: Arc::new(ProgressFeed::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> JobStatus {
        match self.feed.terminal() {
            Some(TerminalStatus::Succeeded) => JobStatus::Succeeded,
            Some(TerminalStatus::Failed(_)) => JobStatus::Failed,
            None if self.started.load(Ordering::Acquire) => JobStatus::Running,
            None => JobStatus::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Reference to the execution serving a job identity.
#[derive(Clone)]
pub struct JobHandle {
    execution: Arc<Execution>,
    attached: bool,
}

impl JobHandle {
    pub fn identity(&self) -> &JobIdentity {
        &self.execution.identity
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution.id
    }

    /// Spec of the execution this handle refers to. For an attached handle
    /// this is the spec of the earlier submission, not the discarded one.
    pub fn spec(&self) -> &JobSpec {
        &self.execution.spec
    }

    /// Whether this handle joined an execution started by an earlier
    /// submission.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn status(&self) -> JobStatus {
        self.execution.status()
    }

    pub fn terminal(&self) -> Option<TerminalStatus> {
        self.execution.feed.terminal()
    }

    pub fn feed(&self) -> &Arc<ProgressFeed> {
        &self.execution.feed
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.execution.feed.subscribe()
    }

    /// Ask the execution to stop at its next safe point.
    pub fn cancel(&self) {
        if self.execution.is_active() {
            tracing::info!(
                identity = %self.execution.identity,
                execution_id = %self.execution.id,
                "Cancellation requested",
            );
        }
        self.execution.cancel.cancel();
    }

    /// Whether both handles refer to the same execution.
    pub fn same_execution(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.execution, &other.execution)
    }
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// Process-wide table of executions keyed by job identity.
pub struct WorkQueue {
    executions: DashMap<JobIdentity, Arc<Execution>>,
    executor: Arc<JobExecutor>,
}

impl WorkQueue {
    pub fn new(applier: Arc<dyn PatchApplier>) -> Self {
        Self {
            executions: DashMap::new(),
            executor: Arc::new(JobExecutor::new(applier)),
        }
    }

    /// Start an execution of `spec` unless one is already active for
    /// `identity`, in which case attach to it.
    ///
    /// Must be called within a Tokio runtime.
    pub fn enqueue_unique(
        &self,
        identity: JobIdentity,
        spec: JobSpec,
    ) -> Result<JobHandle, CoreError> {
        self.prune_finished();

        let execution = match self.executions.entry(identity.clone()) {
            Entry::Occupied(entry) if entry.get().is_active() => {
                tracing::info!(
                    identity = %identity,
                    execution_id = %entry.get().id,
                    "Attached to active execution",
                );
                return Ok(JobHandle {
                    execution: Arc::clone(entry.get()),
                    attached: true,
                });
            }
            Entry::Occupied(mut entry) => {
                let execution = Arc::new(Execution::new(identity.clone(), spec)?);
                tracing::debug!(
                    identity = %identity,
                    previous = %entry.get().id,
                    "Replacing finished execution",
                );
                entry.insert(Arc::clone(&execution));
                execution
            }
            Entry::Vacant(entry) => {
                let execution = Arc::new(Execution::new(identity.clone(), spec)?);
                entry.insert(Arc::clone(&execution));
                execution
            }
        };

        tracing::info!(
            identity = %identity,
            execution_id = %execution.id,
            operations = execution.spec.operations().len(),
            "Execution enqueued",
        );
        self.spawn(Arc::clone(&execution));

        Ok(JobHandle {
            execution,
            attached: false,
        })
    }

    /// Request cancellation of the active execution for `identity`.
    ///
    /// Returns `false` if no active execution exists.
    pub fn cancel(&self, identity: &JobIdentity) -> bool {
        let Some(execution) = self.executions.get(identity).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        if !execution.is_active() {
            return false;
        }
        JobHandle {
            execution,
            attached: true,
        }
        .cancel();
        true
    }

    /// Handle to the execution currently recorded for `identity`.
    pub fn get(&self, identity: &JobIdentity) -> Option<JobHandle> {
        self.executions.get(identity).map(|e| JobHandle {
            execution: Arc::clone(e.value()),
            attached: true,
        })
    }

    /// Identities with a queued or running execution.
    pub fn active_identities(&self) -> Vec<JobIdentity> {
        self.prune_finished();
        let mut identities: Vec<JobIdentity> = self
            .executions
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.key().clone())
            .collect();
        identities.sort();
        identities
    }

    /// Number of executions currently recorded, finished or not.
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    fn prune_finished(&self) {
        self.executions.retain(|identity, execution| {
            let keep = execution.is_active();
            if !keep {
                tracing::trace!(identity = %identity, execution_id = %execution.id, "Pruned finished execution");
            }
            keep
        });
    }

    fn spawn(&self, execution: Arc<Execution>) {
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            execution.started.store(true, Ordering::Release);
            let status = executor
                .run(&execution.payload, &execution.feed, &execution.cancel)
                .await;
            match &status {
                TerminalStatus::Succeeded => tracing::info!(
                    identity = %execution.identity,
                    execution_id = %execution.id,
                    "Execution finished",
                ),
                TerminalStatus::Failed(e) => tracing::warn!(
                    identity = %execution.identity,
                    execution_id = %execution.id,
                    error = %e,
                    "Execution failed",
                ),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use patchline_core::error::PipelineError;
    use patchline_core::types::TargetIdentity;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::services::{ApplyError, PatchSession};

    /// Applier whose operations wait for a permit before completing.
    struct GatedApplier {
        gate: Arc<Semaphore>,
    }

    struct GatedSession {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl PatchApplier for GatedApplier {
        async fn open(&self, _source: &Path) -> Result<Box<dyn PatchSession>, ApplyError> {
            Ok(Box::new(GatedSession {
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    #[async_trait]
    impl PatchSession for GatedSession {
        async fn apply(&mut self, _operation: &str) -> Result<(), ApplyError> {
            let permit = self.gate.acquire().await.map_err(|_| ApplyError::NotLoaded)?;
            permit.forget();
            Ok(())
        }

        async fn write(&mut self, _output: &Path) -> Result<(), ApplyError> {
            Ok(())
        }
    }

    fn gated_queue() -> (WorkQueue, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let queue = WorkQueue::new(Arc::new(GatedApplier {
            gate: Arc::clone(&gate),
        }));
        (queue, gate)
    }

    fn spec(output: &str) -> JobSpec {
        JobSpec::new("/in.apk", output, ["op"], TargetIdentity::new("com.example", "1"))
    }

    #[tokio::test]
    async fn second_submission_attaches_to_active_execution() {
        let (queue, gate) = gated_queue();
        let first = queue
            .enqueue_unique(spec("/a.apk").identity(), spec("/a.apk"))
            .expect("enqueue");
        let second = queue
            .enqueue_unique(spec("/b.apk").identity(), spec("/b.apk"))
            .expect("enqueue");

        assert!(!first.is_attached());
        assert!(second.is_attached());
        assert!(first.same_execution(&second));
        assert_eq!(second.spec().output(), Path::new("/a.apk"));

        gate.add_permits(1);
        let status = second.subscribe().finished().await;
        assert_eq!(status, Some(TerminalStatus::Succeeded));
        assert_eq!(first.status(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn concurrent_submissions_share_one_execution() {
        let (queue, gate) = gated_queue();
        let queue = Arc::new(queue);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let spec = spec(&format!("/out-{i}.apk"));
                    queue.enqueue_unique(spec.identity(), spec).expect("enqueue")
                })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.expect("join"));
        }

        assert!(handles.iter().all(|h| h.same_execution(&handles[0])));
        assert_eq!(handles.iter().filter(|h| !h.is_attached()).count(), 1);

        gate.add_permits(1);
        handles[0].subscribe().finished().await;
    }

    #[tokio::test]
    async fn finished_execution_is_replaced() {
        let (queue, gate) = gated_queue();
        gate.add_permits(1);
        let first = queue
            .enqueue_unique(spec("/a.apk").identity(), spec("/a.apk"))
            .expect("enqueue");
        first.subscribe().finished().await;

        let second = queue
            .enqueue_unique(spec("/b.apk").identity(), spec("/b.apk"))
            .expect("enqueue");
        assert!(!second.is_attached());
        assert!(!first.same_execution(&second));
        assert_eq!(second.spec().output(), Path::new("/b.apk"));

        gate.add_permits(1);
        second.subscribe().finished().await;
    }

    #[tokio::test]
    async fn finished_executions_are_pruned() {
        let (queue, gate) = gated_queue();
        gate.add_permits(1);
        let done = queue
            .enqueue_unique(spec("/a.apk").identity(), spec("/a.apk"))
            .expect("enqueue");
        done.subscribe().finished().await;
        assert_eq!(queue.len(), 1);

        let other = JobSpec::new("/in.apk", "/c.apk", ["op"], TargetIdentity::new("com.other", "2"));
        let running = queue
            .enqueue_unique(other.identity(), other)
            .expect("enqueue");

        assert!(queue.get(done.identity()).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(done.status(), JobStatus::Succeeded, "handle outlives pruning");

        gate.add_permits(1);
        running.subscribe().finished().await;
        assert!(queue.active_identities().is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancel_marks_execution_failed_with_cancellation() {
        let (queue, gate) = gated_queue();
        let handle = queue
            .enqueue_unique(spec("/a.apk").identity(), spec("/a.apk"))
            .expect("enqueue");
        let identity = handle.identity().clone();
        assert_eq!(queue.active_identities(), vec![identity.clone()]);

        assert!(queue.cancel(&identity));
        gate.add_permits(1);

        let status = handle.subscribe().finished().await;
        assert_matches!(
            status,
            Some(TerminalStatus::Failed(PipelineError::CancellationRequested))
        );
        assert_eq!(handle.status(), JobStatus::Failed);
        assert!(queue.active_identities().is_empty());
        assert!(!queue.cancel(&identity), "nothing left to cancel");
    }

    #[test]
    fn cancel_unknown_identity_returns_false() {
        let (queue, _gate) = gated_queue();
        assert!(!queue.cancel(&spec("/a.apk").identity()));
        assert!(queue.get(&spec("/a.apk").identity()).is_none());
    }
}
