// Domain Layer - Job model and its lifecycle rules

pub mod error;
pub mod job;

// Re-exports
pub use error::DomainError;
pub use job::{
    Definition, Job, JobState, JobUid, Priority, Progress, ReplicaId, StateChange, PROGRESS_MAX,
    PROGRESS_MIN,
};
