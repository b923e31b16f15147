//! # pipeline-checkpoint - Step-level state persistence
//!
//! Trait-based checkpoint abstractions for the reelworks pipeline engine.
//! A checkpoint is a snapshot of the full pipeline state captured after a
//! step's successful execution. Checkpoints power:
//!
//! - **Crash recovery** - resume a job without re-running completed steps
//! - **Replay** - reconstruct the state before any step and re-run the tail
//! - **Async-output recovery** - recover fields produced by background steps
//!   that will not themselves be re-executed
//!
//! The [`CheckpointStore`] trait is the storage seam. This crate ships
//! [`InMemoryCheckpointStore`] as the reference implementation; production
//! deployments back the trait with a relational log table (see the
//! orchestrator crate's SQLite store).
//!
//! Checkpoint writes are best-effort by contract: the engine logs and
//! swallows storage failures, because pipeline correctness depends on the
//! main state write, not the checkpoint.

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod traits;

pub use checkpoint::StepCheckpoint;
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use traits::CheckpointStore;
