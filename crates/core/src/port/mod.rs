// Port Layer - Interfaces for external dependencies

pub mod id_provider;
pub mod job_store;
pub mod lock;
pub mod pubsub;
pub mod time_provider;

// Re-exports
pub use id_provider::IdProvider;
pub use job_store::{CreatedJob, JobStore};
pub use lock::{LockConfig, LockError, LockErrorKind, LockProvider, Mutex, MutexManager, MutexOptions};
pub use pubsub::{
    Consumer, HandlerError, MessageHandler, PubSub, PubSubConfig, PubSubError, PubSubProvider, PublishOptions,
    Publisher, SubscribeOptions, Subscriber,
};
pub use time_provider::TimeProvider;
