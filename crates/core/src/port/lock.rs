// Distributed Lock Port
//
// Leases, not permanent guarantees: a crashed holder's lock becomes
// reclaimable once its expiry passes.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Lock backend selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockProvider {
    #[default]
    #[serde(alias = "memory")]
    InMemory,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    LockHeld,
    LockNotHeld,
    ProviderError,
    CannotLock,
    Context,
    MaxRetriesExceeded,
}

impl LockErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockErrorKind::LockHeld => "lock already held",
            LockErrorKind::LockNotHeld => "lock not held",
            LockErrorKind::ProviderError => "lock provider error",
            LockErrorKind::CannotLock => "timeout while trying to acquire lock",
            LockErrorKind::Context => "context error while trying to acquire lock",
            LockErrorKind::MaxRetriesExceeded => "max retries exceeded to acquire lock",
        }
    }

    /// Contention outcomes a leadership loop simply waits out.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            LockErrorKind::CannotLock | LockErrorKind::LockHeld | LockErrorKind::MaxRetriesExceeded
        )
    }
}

#[derive(Error, Debug, Clone)]
#[error("{} on key {}{}", .kind.as_str(), .key, detail_suffix(.message))]
pub struct LockError {
    pub kind: LockErrorKind,
    pub key: String,
    pub message: Option<String>,
}

fn detail_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(" with err: {m}"),
        None => String::new(),
    }
}

impl LockError {
    pub fn new(kind: LockErrorKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Lock manager configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub app: String,
    pub namespace: String,
    pub provider: LockProvider,
    pub expiry: Duration,
    pub tries: u32,
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            app: "conductor".to_string(),
            namespace: "default".to_string(),
            provider: LockProvider::InMemory,
            expiry: Duration::from_secs(8),
            tries: 32,
            retry_delay: Duration::from_millis(250),
        }
    }
}

impl LockConfig {
    pub fn format_key(&self, key: &str) -> String {
        format!("{}:{}:{}", self.app, self.namespace, key)
    }
}

/// Per-mutex overrides of [`LockConfig`]
#[derive(Debug, Clone, Default)]
pub struct MutexOptions {
    pub expiry: Option<Duration>,
    pub tries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl MutexOptions {
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

/// Distributed lock manager
pub trait MutexManager: Send + Sync {
    /// Create a mutex for `key`. The mutex is not held until `lock` succeeds.
    fn new_mutex(&self, key: &str, options: MutexOptions) -> Result<Box<dyn Mutex>, LockError>;
}

#[async_trait]
pub trait Mutex: Send + Sync {
    /// Key being locked (without app/namespace prefix)
    fn key(&self) -> &str;

    /// Acquire the lock, retrying within the configured budget.
    ///
    /// # Errors
    /// - `LockHeld` if this mutex already holds the lock
    /// - `MaxRetriesExceeded` when every try found the key held
    /// - `Context` when `cancel` fires first
    async fn lock(&self, cancel: &CancellationToken) -> Result<(), LockError>;

    /// Release the lock. Fails with `LockNotHeld` if this mutex holds no live lease.
    async fn unlock(&self) -> Result<(), LockError>;

    /// Renew the lease for another expiry period.
    async fn extend(&self) -> Result<(), LockError>;

    /// True while any holder has an unexpired lease on the key.
    async fn is_held(&self) -> bool;

    /// Lease length of this mutex.
    fn expiry(&self) -> Duration;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Lock calls observed by a [`CountingMutexManager`]
    #[derive(Debug, Default)]
    pub struct LockCalls {
        pub locks: AtomicUsize,
        pub unlocks: AtomicUsize,
    }

    /// Single-process manager whose mutexes always succeed (or always fail with `fail_with`)
    #[derive(Default, Clone)]
    pub struct CountingMutexManager {
        pub calls: Arc<LockCalls>,
        pub fail_with: Option<LockErrorKind>,
    }

    impl CountingMutexManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(kind: LockErrorKind) -> Self {
            Self {
                fail_with: Some(kind),
                ..Default::default()
            }
        }
    }

    impl MutexManager for CountingMutexManager {
        fn new_mutex(&self, key: &str, options: MutexOptions) -> Result<Box<dyn Mutex>, LockError> {
            Ok(Box::new(CountingMutex {
                key: key.to_string(),
                expiry: options.expiry.unwrap_or(Duration::from_secs(8)),
                calls: Arc::clone(&self.calls),
                fail_with: self.fail_with,
            }))
        }
    }

    struct CountingMutex {
        key: String,
        expiry: Duration,
        calls: Arc<LockCalls>,
        fail_with: Option<LockErrorKind>,
    }

    #[async_trait]
    impl Mutex for CountingMutex {
        fn key(&self) -> &str {
            &self.key
        }

        async fn lock(&self, _cancel: &CancellationToken) -> Result<(), LockError> {
            if let Some(kind) = self.fail_with {
                return Err(LockError::new(kind, &self.key));
            }
            self.calls.locks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unlock(&self) -> Result<(), LockError> {
            self.calls.unlocks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn extend(&self) -> Result<(), LockError> {
            Ok(())
        }

        async fn is_held(&self) -> bool {
            false
        }

        fn expiry(&self) -> Duration {
            self.expiry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_display() {
        let err = LockError::new(LockErrorKind::LockNotHeld, "purge");
        assert_eq!(err.to_string(), "lock not held on key purge");

        let err = LockError::new(LockErrorKind::ProviderError, "purge").with_message("io");
        assert_eq!(
            err.to_string(),
            "lock provider error on key purge with err: io"
        );
    }

    #[test]
    fn test_format_key() {
        let config = LockConfig {
            app: "app".to_string(),
            namespace: "ns".to_string(),
            ..Default::default()
        };
        assert_eq!(config.format_key("purge"), "app:ns:purge");
    }
}
