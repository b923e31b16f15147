//! Row models for database persistence

pub mod debug_log;
pub mod job;

pub use debug_log::DebugLogRow;
pub use job::VideoJobRow;
