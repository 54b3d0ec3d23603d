//! Domain types shared by every patchline crate.
//!
//! Pure data and pure functions only: the job description
//! ([`types::JobSpec`]), the progress tree ([`progress`]), installer status
//! codes ([`install_status`]) and the error taxonomy ([`error`]). Nothing in
//! this crate performs I/O.

pub mod error;
pub mod install_status;
pub mod progress;
pub mod types;
