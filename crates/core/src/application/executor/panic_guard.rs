// Panic isolation for job executions
use tokio::task::JoinError;
use tracing::error;

/// Outcome of joining a spawned handler task
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Task ran to completion
    Completed(T),
    /// Task panicked; carries the panic message
    Panicked(String),
    /// Task was aborted before completing
    Aborted,
}

/// Convert a join result into a [`PanicGuardResult`].
///
/// A panicking handler must not take the scheduler down with it; the panic
/// payload is logged and returned as a message.
pub fn guard_join<T>(joined: Result<T, JoinError>) -> PanicGuardResult<T> {
    match joined {
        Ok(value) => PanicGuardResult::Completed(value),
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let panic_msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            error!(panic_msg = %panic_msg, "Job handler panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
        Err(_) => PanicGuardResult::Aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_is_caught() {
        let handle = tokio::spawn(async {
            panic!("handler exploded");
        });
        let result: PanicGuardResult<()> = guard_join(handle.await);

        match result {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "handler exploded"),
            other => panic!("expected panic, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_formatted_panic_message() {
        let code = 7;
        let handle = tokio::spawn(async move {
            panic!("exit code {}", code);
        });
        let result: PanicGuardResult<()> = guard_join(handle.await);
        assert!(matches!(result, PanicGuardResult::Panicked(msg) if msg == "exit code 7"));
    }

    #[tokio::test]
    async fn test_completed_and_aborted() {
        let handle = tokio::spawn(async { 42 });
        assert!(matches!(guard_join(handle.await), PanicGuardResult::Completed(42)));

        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        handle.abort();
        assert!(matches!(guard_join(handle.await), PanicGuardResult::Aborted));
    }
}
