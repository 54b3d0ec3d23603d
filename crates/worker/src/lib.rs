//! Local job worker for the patch pipeline.
//!
//! - [`config`]: environment-driven [`WorkerConfig`](config::WorkerConfig).
//! - [`local`]: file-backed applier, signer and installer.
//! - [`driver`]: runs one configured job end to end.

pub mod config;
pub mod driver;
pub mod local;
