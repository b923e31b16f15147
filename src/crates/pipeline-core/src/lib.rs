//! Checkpointed pipeline engine for multi-stage video assembly
//!
//! This crate provides the core of the reelworks orchestrator: a declarative
//! registry of named steps with dependency ordering, a single immutable
//! state value flowing through every step, and an engine that executes a
//! requested step sequence with retry, per-attempt timeouts, per-step
//! persistence and fire-and-wait async subflows.
//!
//! Persistence is behind two seams: [`StateStore`] for the job row and
//! `pipeline_checkpoint::CheckpointStore` for the append-only checkpoint
//! log. In-memory reference implementations of both ship with the crates;
//! the orchestrator crate supplies the SQL-backed ones.

pub mod engine;
pub mod events;
pub mod registry;
pub mod state;
pub mod store;

use thiserror::Error;

pub use engine::PipelineEngine;
pub use events::{ChannelEventSink, EventSink, LogEventSink, PipelineEvent};
pub use registry::{CostCategory, StepCategory, StepDefinition, StepRegistry, ToolSchema};
pub use state::{PipelineState, StepResult, StepTiming, StorytellingMode};
pub use store::{FailureNotifier, InMemoryStateStore, JobStatus, NoopNotifier, StateStore};

/// Errors that can occur while driving a pipeline
#[derive(Debug, Error)]
pub enum EngineError {
    /// Job row could not be found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Requested step is not registered
    #[error("Step not registered: {0}")]
    StepNotFound(String),

    /// A step failed terminally
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// A step's attempt exceeded its declared timeout
    #[error("Step '{step}' timed out after {timeout_s}s")]
    StepTimeout { step: String, timeout_s: u64 },

    /// Background task for an async step died before producing a result
    #[error("Async step '{0}' was aborted")]
    AsyncAborted(String),

    /// State persistence failed
    #[error("State store error: {0}")]
    StateStore(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine version stamped into every new pipeline state
pub const ENGINE_VERSION: &str = "3.0.0";
