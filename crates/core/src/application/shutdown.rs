// Shutdown Token

use tokio_util::sync::CancellationToken;

/// Shutdown signal for graceful termination
#[derive(Clone, Default)]
pub struct ShutdownToken {
    token: CancellationToken,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for shutdown signal
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled on shutdown, or earlier by its own holder
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn as_cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

impl From<CancellationToken> for ShutdownToken {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}

/// Shutdown sender
pub struct ShutdownSender {
    token: CancellationToken,
}

impl ShutdownSender {
    /// Signal shutdown to every loop holding a token
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let token = CancellationToken::new();
    (
        ShutdownSender {
            token: token.clone(),
        },
        ShutdownToken { token },
    )
}
