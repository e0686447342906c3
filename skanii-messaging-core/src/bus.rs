// skanii-messaging-core/src/bus.rs
use std::sync::Arc;
use async_trait::async_trait;
use crate::{ConsumeOptions, MessageHandler, MessagingError, PublishOptions};

/// Publishing surface used by upload/result services.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish<T: serde::Serialize + Send + Sync>(
        &self,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), MessagingError>;

    async fn publish_to_queue<T: serde::Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), MessagingError>;
}

/// Subscription surface used by workers.
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    /// Returns the subscription tag.
    async fn consume(
        &self,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String, MessagingError>;

    async fn stop_consuming(&self, queue: &str) -> Result<(), MessagingError>;
}
