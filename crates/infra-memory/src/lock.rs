// In-process Lock
//
// Leases live in a map shared by every mutex created from the same manager.
// Expired leases are reclaimable by anyone; each mutex carries its own token
// so a stale holder cannot release or renew someone else's lease.

use async_trait::async_trait;
use conductor_core::port::{LockConfig, LockError, LockErrorKind, Mutex, MutexManager, MutexOptions};
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

struct Lease {
    token: String,
    expires_at: Instant,
}

type Leases = Arc<std::sync::Mutex<HashMap<String, Lease>>>;

/// Mutex manager backed by process memory
#[derive(Clone)]
pub struct InMemoryMutexManager {
    config: LockConfig,
    leases: Leases,
}

impl InMemoryMutexManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            leases: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryMutexManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl MutexManager for InMemoryMutexManager {
    fn new_mutex(&self, key: &str, options: MutexOptions) -> Result<Box<dyn Mutex>, LockError> {
        if key.is_empty() {
            return Err(LockError::new(LockErrorKind::ProviderError, key)
                .with_message("empty lock key"));
        }

        Ok(Box::new(InMemoryMutex {
            key: key.to_string(),
            full_key: self.config.format_key(key),
            token: Uuid::new_v4().to_string(),
            expiry: options.expiry.unwrap_or(self.config.expiry),
            tries: options.tries.unwrap_or(self.config.tries).max(1),
            retry_delay: options.retry_delay.unwrap_or(self.config.retry_delay),
            leases: Arc::clone(&self.leases),
        }))
    }
}

struct InMemoryMutex {
    key: String,
    full_key: String,
    token: String,
    expiry: Duration,
    tries: u32,
    retry_delay: Duration,
    leases: Leases,
}

impl InMemoryMutex {
    fn leases(&self) -> MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases();

        if let Some(lease) = leases.get(&self.full_key) {
            if lease.expires_at > now {
                if lease.token == self.token {
                    return Err(LockError::new(LockErrorKind::LockHeld, &self.key));
                }
                return Ok(false);
            }
        }

        leases.insert(
            self.full_key.clone(),
            Lease {
                token: self.token.clone(),
                expires_at: now + self.expiry,
            },
        );
        Ok(true)
    }

    /// Live lease owned by this mutex, if any
    fn owned_lease<'a>(&self, leases: &'a mut HashMap<String, Lease>) -> Option<&'a mut Lease> {
        let now = Instant::now();
        leases
            .get_mut(&self.full_key)
            .filter(|lease| lease.token == self.token && lease.expires_at > now)
    }
}

#[async_trait]
impl Mutex for InMemoryMutex {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        for attempt in 1..=self.tries {
            if cancel.is_cancelled() {
                return Err(LockError::new(LockErrorKind::Context, &self.key));
            }
            if self.try_acquire()? {
                debug!(key = %self.full_key, attempt = attempt, "Lock acquired");
                return Ok(());
            }
            if attempt < self.tries {
                tokio::select! {
                    _ = sleep(self.retry_delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(LockError::new(LockErrorKind::Context, &self.key));
                    }
                }
            }
        }

        let kind = if self.tries <= 1 {
            LockErrorKind::CannotLock
        } else {
            LockErrorKind::MaxRetriesExceeded
        };
        Err(LockError::new(kind, &self.key))
    }

    async fn unlock(&self) -> Result<(), LockError> {
        let mut leases = self.leases();
        if self.owned_lease(&mut leases).is_none() {
            return Err(LockError::new(LockErrorKind::LockNotHeld, &self.key));
        }
        leases.remove(&self.full_key);
        debug!(key = %self.full_key, "Lock released");
        Ok(())
    }

    async fn extend(&self) -> Result<(), LockError> {
        let mut leases = self.leases();
        match self.owned_lease(&mut leases) {
            Some(lease) => {
                lease.expires_at = Instant::now() + self.expiry;
                Ok(())
            }
            None => Err(LockError::new(LockErrorKind::LockNotHeld, &self.key)),
        }
    }

    async fn is_held(&self) -> bool {
        let now = Instant::now();
        self.leases()
            .get(&self.full_key)
            .is_some_and(|lease| lease.expires_at > now)
    }

    fn expiry(&self) -> Duration {
        self.expiry
    }
}
