//! Orchestration layer for the reelworks video pipeline
//!
//! This crate supplies everything around the core engine: SQL-backed state
//! and checkpoint persistence, the replay engine (re-run the pipeline tail
//! from any step with targeted modifications), the auto-runner step presets
//! for the five operating modes, and the distributed render dispatcher
//! (single backend, frame-chunked worker pool, single-job pool, cloud
//! function).

pub mod auto_runner;
pub mod checkpoint_store;
pub mod config;
pub mod db;
pub mod render;
pub mod replay;
pub mod state_manager;

use thiserror::Error;

pub use auto_runner::AutoRunner;
pub use checkpoint_store::SqliteCheckpointStore;
pub use config::{OrchestratorConfig, RenderConfig};
pub use replay::ReplayEngine;
pub use state_manager::StateManager;

/// Errors that can occur in the orchestration layer
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] pipeline_core::EngineError),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] pipeline_checkpoint::CheckpointError),

    /// HTTP error talking to a worker or service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Render dispatch failed
    #[error("Render error: {0}")]
    Render(String),

    /// Replay could not be prepared
    #[error("Replay error: {0}")]
    Replay(String),

    /// A replay modification was rejected
    #[error("Invalid modification: {0}")]
    InvalidModification(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;
