// Conductor Infrastructure - In-process Adapters
// Implements: MutexManager, PubSub, JobStore for single-process deployments and tests

mod job_store;
mod lock;
mod pubsub;

pub use job_store::MemoryJobStore;
pub use lock::InMemoryMutexManager;
pub use pubsub::InMemoryPubSub;
