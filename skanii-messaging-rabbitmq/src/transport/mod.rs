//! Boundary between the client state machine and the broker library.

mod amqp;

pub use amqp::LapinTransport;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use skanii_messaging_core::{
    Delivery, ExchangeType, MessageProperties, MessagingError, QueueOptions,
};
use tokio::sync::mpsc;

/// Asynchronous failure of a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Error(String),
    Closed(String),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Outcome of a broker write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    Accepted,
    /// The message was written but the outbound buffer is above its
    /// high-water mark; wait for a drain before the next write.
    BufferFull,
}

/// Deliveries of one subscription. `None` items are cancellation signals.
pub type DeliveryStream = BoxStream<'static, Result<Option<Delivery>, MessagingError>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection. Drops of the returned connection are reported
    /// on `events`.
    async fn connect(
        &self,
        uri: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportConnection>, MessagingError>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), MessagingError>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishStatus, MessagingError>;

    /// Resolves once the outbound buffer is below its high-water mark.
    async fn wait_for_drain(&self) -> Result<(), MessagingError>;

    /// Starts a subscription; returns the tag and its delivery stream.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(String, DeliveryStream), MessagingError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), MessagingError>;

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), MessagingError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}
