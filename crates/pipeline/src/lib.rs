//! Build -> sign -> install/export pipeline coordination.
//!
//! - [`queue::WorkQueue`]: identity-keyed dedup table; at most one active
//!   execution per job identity.
//! - [`executor::JobExecutor`]: runs the build stage step by step,
//!   publishing snapshots and a terminal status.
//! - [`feed::ProgressFeed`]: push subscription for snapshots and the
//!   terminal status of one execution.
//! - [`bridge::InstallOutcomeBridge`]: correlates installer outcome events
//!   with the job that requested the install.
//! - [`coordinator::Coordinator`]: owns one job: its temporary artifacts,
//!   on-demand signing, export, install, and cleanup on disposal.
//! - [`services`]: the collaborator traits the pipeline consumes.

pub mod bridge;
pub mod coordinator;
pub mod executor;
pub mod feed;
pub mod queue;
pub mod services;
pub mod storage;

mod panic;

pub use bridge::InstallOutcomeBridge;
pub use coordinator::{Coordinator, CoordinatorError, PipelineServices};
pub use executor::JobExecutor;
pub use feed::{ProgressEvent, ProgressFeed, ProgressSubscription, TerminalStatus};
pub use queue::{JobHandle, JobStatus, WorkQueue};
pub use storage::ScratchDir;
