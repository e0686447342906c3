// skanii-messaging-core/src/handler.rs
use crate::{Delivery, MessagingError};
use async_trait::async_trait;

/// Settles one specific delivery.
///
/// Only the first settlement reaches the broker; later calls are ignored.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), MessagingError>;

    async fn nack(&self, requeue: bool) -> Result<(), MessagingError>;

    async fn reject(&self, requeue: bool) -> Result<(), MessagingError>;
}

/// Processes deliveries of a subscription.
///
/// Returning `Ok` acknowledges the delivery unless the handler already
/// settled it through `acker`; returning `Err` requeues it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &Delivery,
        acker: &dyn Acknowledger,
    ) -> Result<(), MessagingError>;
}
