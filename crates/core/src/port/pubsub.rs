// Publish/Subscribe Port
//
// Best-effort, at-most-once broadcast. Persisted job state is the source of
// truth; messages may be dropped for slow subscribers.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// PubSub backend selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubProvider {
    #[default]
    #[serde(alias = "memory")]
    InMemory,
    Redis,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PubSubError {
    #[error("pubsub: subscriber is already closed")]
    AlreadyClosed,

    #[error("pubsub: provider error: {0}")]
    Provider(String),
}

/// Error returned by a subscription handler; logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked once per delivered message
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub app: String,
    pub namespace: String,
    pub provider: PubSubProvider,
    /// Per-subscriber send timeout after which a message is dropped.
    pub send_timeout: Duration,
    /// Buffer size of each subscriber's channel.
    pub channel_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            app: "app".to_string(),
            namespace: "default".to_string(),
            provider: PubSubProvider::InMemory,
            send_timeout: Duration::from_secs(60),
            channel_size: 100,
        }
    }
}

/// Overrides applied to a single publish call
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub app: Option<String>,
    pub namespace: Option<String>,
}

impl PublishOptions {
    pub fn namespace(value: impl Into<String>) -> Self {
        Self {
            namespace: Some(value.into()),
            ..Default::default()
        }
    }
}

/// Overrides applied to a single subscription
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub app: Option<String>,
    pub namespace: Option<String>,
    pub send_timeout: Option<Duration>,
    pub channel_size: Option<usize>,
}

impl SubscribeOptions {
    pub fn namespace(value: impl Into<String>) -> Self {
        Self {
            namespace: Some(value.into()),
            ..Default::default()
        }
    }
}

/// Full topic name: `app:namespace:topic`
pub fn format_topic(app: &str, namespace: &str, topic: &str) -> String {
    format!("{app}:{namespace}:{topic}")
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to every open subscriber of `topic`.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), PubSubError>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Register `handler` for `topic`. Delivery runs until the consumer is closed.
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Box<dyn Consumer>;
}

pub trait PubSub: Publisher + Subscriber {}

impl<T: Publisher + Subscriber> PubSub for T {}

pub trait Consumer: Send + Sync {
    /// Stop delivery. A second call fails with [`PubSubError::AlreadyClosed`].
    fn close(&self) -> Result<(), PubSubError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Publisher that records every message instead of delivering it
    #[derive(Default)]
    pub struct RecordingPublisher {
        messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Payloads published to `topic`, oldest first
        pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            _options: PublishOptions,
        ) -> Result<(), PubSubError> {
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }
}
