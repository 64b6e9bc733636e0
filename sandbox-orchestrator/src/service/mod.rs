//! Service Module
//!
//! Business logic layer for the orchestrator: the job registry, worker
//! supervision and the orchestrator that ties them together.

pub mod job;
pub mod orchestrator;
pub mod stream;
mod supervisor;

// Re-export for convenience
pub use job::{JobError, JobRegistry};
pub use orchestrator::JobOrchestrator;
pub use stream::JobStream;
