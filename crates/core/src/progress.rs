//! Progress model for a build job.
//!
//! A [`ProgressModel`] fixes the full step layout of a job (derived from its
//! selected operations). The executor reports progress as a flat
//! [`StatusUpdate`] keyed by (group, step); [`ProgressModel::rebuild`] turns
//! that into a complete [`ProgressSnapshot`], filling every step the update
//! does not mention with [`StepStatus::Pending`].
//!
//! Snapshots are values. Observers always receive a whole new snapshot,
//! never an in-place patch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::JobSpec;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Group holding the steps that read the source artifact.
pub const GROUP_PREPARATION: &str = "Preparation";

/// Group holding one step per selected operation.
pub const GROUP_PATCHING: &str = "Patching";

/// Group holding the steps that write the output artifact.
pub const GROUP_SAVING: &str = "Saving";

pub const STEP_LOAD_SOURCE: &str = "Load source artifact";

pub const STEP_WRITE_OUTPUT: &str = "Write output artifact";

// ---------------------------------------------------------------------------
// Steps and groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Position in the Pending -> Running -> terminal progression.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: StepStatus,
    pub message: Option<String>,
}

/// A named, ordered sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGroup {
    pub name: String,
    pub steps: Vec<Step>,
}

impl StageGroup {
    /// Aggregate status of the group.
    ///
    /// - Any failed step fails the group.
    /// - All steps succeeded (or no steps) means the group succeeded.
    /// - Otherwise the group is running once any step has left Pending.
    pub fn status(&self) -> StepStatus {
        if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            return StepStatus::Failed;
        }
        if self.steps.iter().all(|s| s.status == StepStatus::Succeeded) {
            return StepStatus::Succeeded;
        }
        if self.steps.iter().any(|s| s.status != StepStatus::Pending) {
            return StepStatus::Running;
        }
        StepStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Flat status updates
// ---------------------------------------------------------------------------

/// Address of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub group: String,
    pub step: String,
}

impl StepKey {
    pub fn new(group: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            step: step.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub message: Option<String>,
}

/// Flat mapping from (group, step) to status, produced at each reporting
/// point of the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    entries: BTreeMap<StepKey, StepState>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state of one step, replacing any earlier entry.
    pub fn set(
        &mut self,
        key: StepKey,
        status: StepStatus,
        message: Option<String>,
    ) -> &mut Self {
        self.entries.insert(key, StepState { status, message });
        self
    }

    pub fn get(&self, key: &StepKey) -> Option<&StepState> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StepKey, &StepState)> {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Complete, immutable view of a job's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    groups: Vec<StageGroup>,
}

impl ProgressSnapshot {
    pub fn groups(&self) -> &[StageGroup] {
        &self.groups
    }

    pub fn step(&self, key: &StepKey) -> Option<&Step> {
        self.groups
            .iter()
            .find(|g| g.name == key.group)
            .and_then(|g| g.steps.iter().find(|s| s.name == key.step))
    }

    /// All steps in display order, paired with their key.
    pub fn steps(&self) -> impl Iterator<Item = (StepKey, &Step)> {
        self.groups.iter().flat_map(|g| {
            g.steps
                .iter()
                .map(move |s| (StepKey::new(g.name.clone(), s.name.clone()), s))
        })
    }

    /// The step currently running, if any.
    pub fn running_step(&self) -> Option<StepKey> {
        self.steps()
            .find(|(_, s)| s.status == StepStatus::Running)
            .map(|(key, _)| key)
    }

    /// Keys of the steps whose status or message differ from `previous`.
    pub fn changed_since(&self, previous: &ProgressSnapshot) -> Vec<StepKey> {
        self.steps()
            .filter(|(key, step)| previous.step(key) != Some(*step))
            .map(|(key, _)| key)
            .collect()
    }

    /// Whether any step of `previous` would move backwards in this snapshot
    /// (for example Succeeded back to Pending).
    pub fn regresses(&self, previous: &ProgressSnapshot) -> bool {
        previous.steps().any(|(key, old)| match self.step(&key) {
            Some(new) => {
                new.status.rank() < old.status.rank()
                    || (old.status.is_terminal() && new.status != old.status)
            }
            None => true,
        })
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Step layout of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressModel {
    layout: Vec<(String, Vec<String>)>,
}

impl ProgressModel {
    /// Layout for a job applying `operations` in order.
    pub fn for_operations(operations: &[String]) -> Self {
        Self {
            layout: vec![
                (
                    GROUP_PREPARATION.to_string(),
                    vec![STEP_LOAD_SOURCE.to_string()],
                ),
                (GROUP_PATCHING.to_string(), operations.to_vec()),
                (GROUP_SAVING.to_string(), vec![STEP_WRITE_OUTPUT.to_string()]),
            ],
        }
    }

    pub fn for_spec(spec: &JobSpec) -> Self {
        Self::for_operations(spec.operations())
    }

    /// Every step key in execution order.
    pub fn step_keys(&self) -> impl Iterator<Item = StepKey> + '_ {
        self.layout.iter().flat_map(|(group, steps)| {
            steps
                .iter()
                .map(move |step| StepKey::new(group.clone(), step.clone()))
        })
    }

    pub fn step_count(&self) -> usize {
        self.layout.iter().map(|(_, steps)| steps.len()).sum()
    }

    /// Snapshot with every step Pending.
    pub fn initial(&self) -> ProgressSnapshot {
        self.rebuild(&StatusUpdate::new())
    }

    /// Regenerate a full snapshot from a flat update.
    ///
    /// Every step of the layout appears exactly once; steps missing from
    /// `update` are Pending and keys outside the layout are ignored. The
    /// result depends only on `update`.
    pub fn rebuild(&self, update: &StatusUpdate) -> ProgressSnapshot {
        let groups = self
            .layout
            .iter()
            .map(|(group, steps)| StageGroup {
                name: group.clone(),
                steps: steps
                    .iter()
                    .map(|step| {
                        let state = update
                            .get(&StepKey::new(group.clone(), step.clone()))
                            .cloned()
                            .unwrap_or_default();
                        Step {
                            name: step.clone(),
                            status: state.status,
                            message: state.message,
                        }
                    })
                    .collect(),
            })
            .collect();

        ProgressSnapshot { groups }
    }

    /// Alias of [`ProgressModel::rebuild`].
    pub fn groups_from_flat_update(&self, update: &StatusUpdate) -> ProgressSnapshot {
        self.rebuild(update)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ProgressModel {
        ProgressModel::for_operations(&["a".to_string(), "b".to_string()])
    }

    fn patching(step: &str) -> StepKey {
        StepKey::new(GROUP_PATCHING, step)
    }

    #[test]
    fn layout_has_three_groups_in_order() {
        let snapshot = model().initial();
        let names: Vec<&str> = snapshot.groups().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, [GROUP_PREPARATION, GROUP_PATCHING, GROUP_SAVING]);
        assert_eq!(model().step_count(), 4);
    }

    #[test]
    fn initial_snapshot_is_all_pending() {
        let snapshot = model().initial();
        assert!(snapshot
            .steps()
            .all(|(_, s)| s.status == StepStatus::Pending && s.message.is_none()));
    }

    #[test]
    fn rebuild_is_deterministic() {
        let mut update = StatusUpdate::new();
        update
            .set(patching("b"), StepStatus::Running, None)
            .set(
                StepKey::new(GROUP_PREPARATION, STEP_LOAD_SOURCE),
                StepStatus::Succeeded,
                None,
            );

        let first = model().rebuild(&update);
        let second = model().rebuild(&update.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn partial_update_never_shrinks_the_step_list() {
        let mut update = StatusUpdate::new();
        update.set(patching("a"), StepStatus::Succeeded, None);

        let snapshot = model().rebuild(&update);
        let keys: Vec<StepKey> = snapshot.steps().map(|(k, _)| k).collect();
        let expected: Vec<StepKey> = model().step_keys().collect();
        assert_eq!(keys, expected);
        assert_eq!(
            snapshot.step(&patching("b")).map(|s| s.status),
            Some(StepStatus::Pending)
        );
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut update = StatusUpdate::new();
        update.set(patching("zzz"), StepStatus::Failed, None);
        assert_eq!(model().rebuild(&update), model().initial());
    }

    #[test]
    fn messages_are_carried_into_steps() {
        let mut update = StatusUpdate::new();
        update.set(patching("a"), StepStatus::Failed, Some("bad offset".into()));
        let snapshot = model().rebuild(&update);
        assert_eq!(
            snapshot.step(&patching("a")).and_then(|s| s.message.clone()),
            Some("bad offset".to_string())
        );
    }

    #[test]
    fn running_step_is_found() {
        let mut update = StatusUpdate::new();
        update.set(patching("b"), StepStatus::Running, None);
        assert_eq!(model().rebuild(&update).running_step(), Some(patching("b")));
        assert_eq!(model().initial().running_step(), None);
    }

    #[test]
    fn group_status_aggregates_steps() {
        let mut update = StatusUpdate::new();
        update.set(patching("a"), StepStatus::Succeeded, None);
        let snapshot = model().rebuild(&update);
        assert_eq!(snapshot.groups()[1].status(), StepStatus::Running);

        update.set(patching("b"), StepStatus::Failed, None);
        let snapshot = model().rebuild(&update);
        assert_eq!(snapshot.groups()[1].status(), StepStatus::Failed);
        assert_eq!(snapshot.groups()[0].status(), StepStatus::Pending);
    }

    #[test]
    fn empty_group_counts_as_succeeded() {
        let model = ProgressModel::for_operations(&[]);
        assert_eq!(model.initial().groups()[1].status(), StepStatus::Succeeded);
    }

    #[test]
    fn changed_since_lists_only_modified_steps() {
        let before = model().initial();
        let mut update = StatusUpdate::new();
        update.set(patching("a"), StepStatus::Running, None);
        let after = model().rebuild(&update);
        assert_eq!(after.changed_since(&before), vec![patching("a")]);
        assert!(after.changed_since(&after).is_empty());
    }

    #[test]
    fn regression_is_detected() {
        let mut update = StatusUpdate::new();
        update.set(patching("a"), StepStatus::Succeeded, None);
        let done = model().rebuild(&update);

        let pending = model().initial();
        assert!(pending.regresses(&done));
        assert!(!done.regresses(&pending));
        assert!(!done.regresses(&done));
    }
}
