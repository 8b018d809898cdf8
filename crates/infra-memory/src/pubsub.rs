// In-process PubSub
//
// Every subscriber owns a bounded channel drained by its own task. Publishing
// races each send against the subscriber's send timeout, so one slow
// subscriber only loses its own copy of a message.

use async_trait::async_trait;
use conductor_core::port::pubsub::format_topic;
use conductor_core::port::{
    Consumer, MessageHandler, PubSubConfig, PubSubError, PublishOptions, Publisher,
    SubscribeOptions, Subscriber,
};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Subscription {
    topic: String,
    tx: mpsc::Sender<Vec<u8>>,
    send_timeout: Duration,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl Subscription {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct InMemoryPubSub {
    config: PubSubConfig,
    registry: Arc<Mutex<Vec<Arc<Subscription>>>>,
}

impl InMemoryPubSub {
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle on the same registry whose default namespace is `namespace`
    pub fn scoped(&self, namespace: &str) -> Self {
        let mut config = self.config.clone();
        config.namespace = namespace.to_string();
        Self {
            config,
            registry: Arc::clone(&self.registry),
        }
    }

    fn full_topic(&self, app: Option<&str>, namespace: Option<&str>, topic: &str) -> String {
        format_topic(
            app.unwrap_or(&self.config.app),
            namespace.unwrap_or(&self.config.namespace),
            topic,
        )
    }

    /// Open subscriptions to `topic`; closed ones are dropped from the registry.
    fn subscribers_of(&self, topic: &str) -> Vec<Arc<Subscription>> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.retain(|sub| sub.is_open());
        registry
            .iter()
            .filter(|sub| sub.topic == topic)
            .cloned()
            .collect()
    }

    /// Subscriptions currently registered, closed ones included until the next publish
    pub fn subscription_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(PubSubConfig::default())
    }
}

#[async_trait]
impl Publisher for InMemoryPubSub {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), PubSubError> {
        let topic = self.full_topic(options.app.as_deref(), options.namespace.as_deref(), topic);
        let subscribers = self.subscribers_of(&topic);

        let sends = subscribers.iter().map(|sub| {
            let payload = payload.clone();
            let topic = &topic;
            async move {
                match timeout(sub.send_timeout, sub.tx.send(payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => debug!(topic = %topic, "Subscriber gone, message dropped"),
                    Err(_) => warn!(
                        topic = %topic,
                        timeout_ms = %sub.send_timeout.as_millis(),
                        "Subscriber too slow, message dropped"
                    ),
                }
            }
        });
        join_all(sends).await;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryPubSub {
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Box<dyn Consumer> {
        let topic = self.full_topic(options.app.as_deref(), options.namespace.as_deref(), topic);
        let channel_size = options.channel_size.unwrap_or(self.config.channel_size).max(1);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(channel_size);

        let subscription = Arc::new(Subscription {
            topic: topic.clone(),
            tx,
            send_timeout: options.send_timeout.unwrap_or(self.config.send_timeout),
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
        });

        let stop = subscription.stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(payload) => {
                            if let Err(e) = handler(payload) {
                                warn!(topic = %topic, error = %e, "Subscriber handler failed");
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(topic = %topic, "Subscriber stopped");
        });

        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&subscription));

        Box::new(InMemoryConsumer { subscription })
    }
}

struct InMemoryConsumer {
    subscription: Arc<Subscription>,
}

impl Consumer for InMemoryConsumer {
    fn close(&self) -> Result<(), PubSubError> {
        if self.subscription.closed.swap(true, Ordering::SeqCst) {
            return Err(PubSubError::AlreadyClosed);
        }
        self.subscription.stop.cancel();
        Ok(())
    }
}
