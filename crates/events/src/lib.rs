//! Process-scoped installer event bus.
//!
//! - [`InstallerBus`]: publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, shared via `Arc<InstallerBus>`.
//! - [`InstallerEvent`]: an install or uninstall outcome reported by the
//!   out-of-process installer, tagged with the job identity it belongs to.

pub mod bus;

pub use bus::{InstallerAction, InstallerBus, InstallerEvent};
