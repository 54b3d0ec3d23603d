//! Build stage runner.
//!
//! [`JobExecutor::run`] decodes the execution payload into a [`JobSpec`],
//! then walks the build steps in order: load the source artifact, apply each
//! selected operation, write the output artifact. Every transition is
//! published to the [`ProgressFeed`] as a full snapshot rebuilt from the
//! accumulated flat status update, so snapshots only ever move forward.
//!
//! Cancellation is honoured between steps and once more after the last one.
//! A panic inside a step is caught
//! at the step boundary and reported as a failure of that step.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use patchline_core::error::PipelineError;
use patchline_core::progress::{
    ProgressModel, StatusUpdate, StepKey, StepStatus, GROUP_PATCHING, GROUP_PREPARATION,
    GROUP_SAVING, STEP_LOAD_SOURCE, STEP_WRITE_OUTPUT,
};
use patchline_core::types::JobSpec;
use tokio_util::sync::CancellationToken;

use crate::feed::{ProgressFeed, TerminalStatus};
use crate::panic::panic_message;
use crate::services::{ApplyError, PatchApplier, PatchSession};

/// One unit of build work.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BuildStep {
    LoadSource,
    Apply(String),
    WriteOutput,
}

/// Ordered build plan for `spec`, each step paired with its progress key.
fn build_plan(spec: &JobSpec) -> Vec<(StepKey, BuildStep)> {
    let mut plan = vec![(
        StepKey::new(GROUP_PREPARATION, STEP_LOAD_SOURCE),
        BuildStep::LoadSource,
    )];
    plan.extend(spec.operations().iter().map(|op| {
        (
            StepKey::new(GROUP_PATCHING, op.clone()),
            BuildStep::Apply(op.clone()),
        )
    }));
    plan.push((
        StepKey::new(GROUP_SAVING, STEP_WRITE_OUTPUT),
        BuildStep::WriteOutput,
    ));
    plan
}

/// Accumulates step states and republishes the full snapshot on each change.
struct Reporter<'a> {
    model: ProgressModel,
    update: StatusUpdate,
    feed: &'a ProgressFeed,
}

impl<'a> Reporter<'a> {
    fn new(model: ProgressModel, feed: &'a ProgressFeed) -> Self {
        Self {
            model,
            update: StatusUpdate::new(),
            feed,
        }
    }

    fn mark(&mut self, key: &StepKey, status: StepStatus, message: Option<String>) {
        self.update.set(key.clone(), status, message);
        self.feed.publish(self.model.rebuild(&self.update));
    }
}

/// Runs the build stage of a job.
pub struct JobExecutor {
    applier: Arc<dyn PatchApplier>,
}

impl JobExecutor {
    pub fn new(applier: Arc<dyn PatchApplier>) -> Self {
        Self { applier }
    }

    /// Run the build described by `payload` to completion or cancellation.
    ///
    /// The returned status has already been delivered to `feed`.
    pub async fn run(
        &self,
        payload: &str,
        feed: &ProgressFeed,
        cancel: &CancellationToken,
    ) -> TerminalStatus {
        let spec = match JobSpec::from_payload(payload) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::error!(error = %e, "Rejected malformed job payload");
                return finish(
                    feed,
                    TerminalStatus::Failed(PipelineError::BuildStepFailure {
                        step: STEP_LOAD_SOURCE.to_string(),
                        cause: e.to_string(),
                    }),
                );
            }
        };

        let identity = spec.identity();
        let mut reporter = Reporter::new(ProgressModel::for_spec(&spec), feed);
        feed.publish(reporter.model.initial());

        let mut session: Option<Box<dyn PatchSession>> = None;

        for (key, step) in build_plan(&spec) {
            if cancel.is_cancelled() {
                tracing::info!(identity = %identity, next_step = %key.step, "Build cancelled");
                return finish(
                    feed,
                    TerminalStatus::Failed(PipelineError::CancellationRequested),
                );
            }

            reporter.mark(&key, StepStatus::Running, None);
            tracing::debug!(identity = %identity, group = %key.group, step = %key.step, "Step started");

            let outcome = AssertUnwindSafe(self.run_step(&step, &spec, &mut session))
                .catch_unwind()
                .await;

            let cause = match outcome {
                Ok(Ok(())) => {
                    reporter.mark(&key, StepStatus::Succeeded, None);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("step panicked: {}", panic_message(panic)),
            };

            tracing::warn!(identity = %identity, step = %key.step, cause = %cause, "Step failed");
            reporter.mark(&key, StepStatus::Failed, Some(cause.clone()));
            return finish(
                feed,
                TerminalStatus::Failed(PipelineError::BuildStepFailure {
                    step: key.step,
                    cause,
                }),
            );
        }

        // A cancel that lands during the final step still fails the run.
        if cancel.is_cancelled() {
            tracing::info!(identity = %identity, "Build cancelled after final step");
            return finish(
                feed,
                TerminalStatus::Failed(PipelineError::CancellationRequested),
            );
        }

        tracing::info!(identity = %identity, output = %spec.output().display(), "Build succeeded");
        finish(feed, TerminalStatus::Succeeded)
    }

    async fn run_step(
        &self,
        step: &BuildStep,
        spec: &JobSpec,
        session: &mut Option<Box<dyn PatchSession>>,
    ) -> Result<(), ApplyError> {
        match step {
            BuildStep::LoadSource => {
                *session = Some(self.applier.open(spec.source()).await?);
                Ok(())
            }
            BuildStep::Apply(operation) => {
                session
                    .as_mut()
                    .ok_or(ApplyError::NotLoaded)?
                    .apply(operation)
                    .await
            }
            BuildStep::WriteOutput => {
                session
                    .as_mut()
                    .ok_or(ApplyError::NotLoaded)?
                    .write(spec.output())
                    .await
            }
        }
    }
}

fn finish(feed: &ProgressFeed, status: TerminalStatus) -> TerminalStatus {
    feed.finish(status.clone());
    status
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
