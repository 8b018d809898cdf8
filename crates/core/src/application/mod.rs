// Application Layer - Scheduling engine and use cases

pub mod background;
pub mod constants;
pub mod events;
pub mod executor;
pub mod maintenance;
pub mod retry;
pub mod scheduler;
pub mod shutdown;

// Re-exports
pub use background::{BackgroundService, BackgroundServiceRunner};
pub use executor::{Executor, Handler, JobContext, ProgressReporter};
pub use maintenance::PurgeHandler;
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerService};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
