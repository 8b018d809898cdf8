// Conductor Core - Job model, ports and the scheduling engine
// NO infrastructure dependencies: stores, locks and pubsub live behind ports

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
