// Background Service Runner
// Leader-elected singleton loops: each service runs on at most one replica at a time

use crate::application::constants::DEFAULT_BACKGROUND_POLL_INTERVAL;
use crate::application::shutdown::ShutdownToken;
use crate::error::{AppError, Result};
use crate::port::{LockErrorKind, Mutex, MutexManager, MutexOptions};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn};

/// Long-running loop that must run on a single replica
#[async_trait]
pub trait BackgroundService: Send + Sync {
    fn name(&self) -> &str;

    /// Pause between leadership attempts
    fn wait_for(&self) -> Duration {
        DEFAULT_BACKGROUND_POLL_INTERVAL
    }

    /// Run until `shutdown` fires. The token also fires when leadership is lost.
    async fn run(&self, shutdown: ShutdownToken) -> Result<()>;
}

/// How one term of leadership ended
enum Term {
    Shutdown,
    LeaseLost,
    Returned(Result<()>),
}

pub struct BackgroundServiceRunner {
    mutex_manager: Arc<dyn MutexManager>,
    services: Vec<Arc<dyn BackgroundService>>,
}

impl BackgroundServiceRunner {
    pub fn new(mutex_manager: Arc<dyn MutexManager>) -> Self {
        Self {
            mutex_manager,
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: Arc<dyn BackgroundService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn lock_key(service_name: &str) -> String {
        format!("background:{service_name}")
    }

    /// Run every service concurrently until shutdown.
    ///
    /// Returns the first service error; other services keep running until
    /// they stop on their own or shutdown fires.
    pub async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        for service in &self.services {
            let mutex_manager = Arc::clone(&self.mutex_manager);
            let service = Arc::clone(service);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { run_service(mutex_manager, service, shutdown).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| AppError::Internal(format!("background service task failed: {e}")))
                .and_then(|result| result);
            if let Err(e) = outcome {
                error!(error = %e, "Background service stopped with error");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_service(
    mutex_manager: Arc<dyn MutexManager>,
    service: Arc<dyn BackgroundService>,
    shutdown: ShutdownToken,
) -> Result<()> {
    let name = service.name().to_string();
    let mx = mutex_manager.new_mutex(
        &BackgroundServiceRunner::lock_key(&name),
        MutexOptions::default().with_tries(1),
    )?;

    info!(service = %name, "Background service waiting for leadership");
    loop {
        if shutdown.is_shutdown() {
            return Ok(());
        }

        if mx.is_held().await {
            debug!(service = %name, "Background service led elsewhere");
            if pause(service.wait_for(), &shutdown).await {
                return Ok(());
            }
            continue;
        }

        match mx.lock(shutdown.as_cancellation()).await {
            Ok(()) => {}
            Err(e) if e.kind == LockErrorKind::Context => return Ok(()),
            Err(e) => {
                if e.kind.is_contention() {
                    debug!(service = %name, error = %e, "Lost leadership race");
                } else {
                    warn!(service = %name, error = %e, "Failed to acquire service lock");
                }
                if pause(service.wait_for(), &shutdown).await {
                    return Ok(());
                }
                continue;
            }
        }

        info!(service = %name, "Background service leadership acquired");
        let term = lead(mx.as_ref(), service.as_ref(), &shutdown).await;

        if let Err(e) = mx.unlock().await {
            if e.kind != LockErrorKind::LockNotHeld {
                warn!(service = %name, error = %e, "Failed to release service lock");
            }
        }

        match term {
            Term::Shutdown => {
                info!(service = %name, "Background service stopped");
                return Ok(());
            }
            Term::LeaseLost => {
                warn!(service = %name, "Background service lost its lease, re-electing");
            }
            Term::Returned(Ok(())) => {
                debug!(service = %name, "Background service returned, re-electing");
                if pause(service.wait_for(), &shutdown).await {
                    return Ok(());
                }
            }
            Term::Returned(Err(e)) => return Err(e),
        }
    }
}

/// Run the service body while renewing the lease every `expiry / 2`.
async fn lead(mx: &dyn Mutex, service: &dyn BackgroundService, shutdown: &ShutdownToken) -> Term {
    let body_token = shutdown.child();
    let body = service.run(ShutdownToken::from(body_token.clone()));
    tokio::pin!(body);

    let every = (mx.expiry() / 2).max(Duration::from_millis(1));
    let mut renew = interval_at(Instant::now() + every, every);

    loop {
        tokio::select! {
            result = &mut body => {
                if shutdown.is_shutdown() {
                    if let Err(e) = result {
                        warn!(service = %service.name(), error = %e, "Background service failed during shutdown");
                    }
                    return Term::Shutdown;
                }
                return Term::Returned(result);
            }
            _ = renew.tick() => {
                if let Err(e) = mx.extend().await {
                    warn!(service = %service.name(), error = %e, "Failed to extend service lease");
                    body_token.cancel();
                    if let Err(e) = body.await {
                        debug!(service = %service.name(), error = %e, "Background service ended after lease loss");
                    }
                    return Term::LeaseLost;
                }
            }
        }
    }
}

/// Sleep for `wait` unless shutdown fires first. Returns true on shutdown.
async fn pause(wait: Duration, shutdown: &ShutdownToken) -> bool {
    tokio::select! {
        _ = sleep(wait) => false,
        _ = shutdown.wait() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::shutdown::shutdown_channel;
    use crate::port::lock::mocks::CountingMutexManager;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UntilShutdown {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl BackgroundService for UntilShutdown {
        fn name(&self) -> &str {
            "until-shutdown"
        }

        async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            shutdown.wait().await;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl BackgroundService for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn run(&self, _shutdown: ShutdownToken) -> Result<()> {
            Err(AppError::Internal("boom".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_lock() {
        let locks = CountingMutexManager::new();
        let service = Arc::new(UntilShutdown {
            runs: AtomicUsize::new(0),
        });
        let runner = BackgroundServiceRunner::new(Arc::new(locks.clone()))
            .with_service(service.clone());

        let (tx, token) = shutdown_channel();
        let handle = tokio::spawn(async move { runner.run(token).await });

        // lets the lease renew a few times
        sleep(Duration::from_secs(20)).await;
        tx.shutdown();

        handle.await.unwrap().unwrap();
        assert_eq!(service.runs.load(Ordering::SeqCst), 1);
        assert_eq!(locks.calls.locks.load(Ordering::SeqCst), 1);
        assert_eq!(locks.calls.unlocks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_body_error_propagates_and_releases_lock() {
        let locks = CountingMutexManager::new();
        let runner =
            BackgroundServiceRunner::new(Arc::new(locks.clone())).with_service(Arc::new(Broken));

        let (_tx, token) = shutdown_channel();
        let err = runner.run(token).await.unwrap_err();

        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(locks.calls.unlocks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_errors_back_off_until_shutdown() {
        let locks = CountingMutexManager::failing(LockErrorKind::ProviderError);
        let service = Arc::new(UntilShutdown {
            runs: AtomicUsize::new(0),
        });
        let runner =
            BackgroundServiceRunner::new(Arc::new(locks)).with_service(service.clone());

        let (tx, token) = shutdown_channel();
        let handle = tokio::spawn(async move { runner.run(token).await });

        sleep(DEFAULT_BACKGROUND_POLL_INTERVAL * 3).await;
        tx.shutdown();

        handle.await.unwrap().unwrap();
        assert_eq!(service.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(BackgroundServiceRunner::lock_key("scheduler"), "background:scheduler");
    }
}
