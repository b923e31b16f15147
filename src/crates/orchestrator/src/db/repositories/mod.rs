//! Repositories for database operations

pub mod debug_log_repo;
pub mod render_version_repo;

pub use debug_log_repo::DebugLogRepository;
pub use render_version_repo::RenderVersionRepository;
