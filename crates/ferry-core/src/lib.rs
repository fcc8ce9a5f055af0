//! Resumable, memory-bounded bulk transfers driven through an external
//! transfer service.
//!
//! The engine enumerates a source tree through [`backend::TransferBackend`],
//! groups files into batches, submits each batch as a backend job and records
//! progress in a [`checkpoint::CheckpointState`] so an interrupted transfer can
//! pick up where it stopped.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod enumeration;
pub mod errors;
pub mod orchestrator;
pub mod planner;
pub mod retry;

pub use orchestrator::{Orchestrator, ResumeOptions, ResumeResult, TransferRequest};
