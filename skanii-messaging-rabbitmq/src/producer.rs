use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use skanii_messaging_core::{
    MessageProperties, MessagePublisher, MessagingError, PublishOptions, QueueOptions,
    JSON_CONTENT_TYPE,
};
use tracing::{debug, error, warn};

use crate::{
    connection::{ConnectionManager, ConnectionState},
    options::RabbitMqOptions,
    transport::{LapinTransport, PublishStatus, Transport, TransportChannel},
};

/// Publishes JSON messages to the configured exchange or straight to a queue.
///
/// Connects lazily on the first publish.
#[derive(Clone)]
pub struct Producer {
    opts: Arc<RabbitMqOptions>,
    connection: ConnectionManager,
}

impl Producer {
    pub fn new(opts: RabbitMqOptions) -> Self {
        let transport = Arc::new(LapinTransport::from_options(&opts));
        Self::with_transport(opts, transport)
    }

    pub fn with_transport(opts: RabbitMqOptions, transport: Arc<dyn Transport>) -> Self {
        let opts = Arc::new(opts);
        Self {
            connection: ConnectionManager::new(Arc::clone(&opts), transport),
            opts,
        }
    }

    pub fn options(&self) -> &RabbitMqOptions {
        &self.opts
    }

    pub async fn connect(&self) -> Result<(), MessagingError> {
        self.connection.connect().await
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.connection.close().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn properties(&self, options: &PublishOptions) -> MessageProperties {
        MessageProperties {
            message_id: options.message_id.clone(),
            correlation_id: options.correlation_id.clone(),
            reply_to: options.reply_to.clone(),
            expiration: options.expiration.clone(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            priority: options.priority,
            timestamp: Some(
                options
                    .timestamp
                    .unwrap_or_else(|| Utc::now().timestamp_millis().max(0) as u64),
            ),
            persistent: options.persistent.unwrap_or(true),
            headers: options.headers.clone(),
        }
    }

    /// Writes one message; waits for a drain when the buffer reports full.
    async fn send(
        &self,
        ch: &dyn TransportChannel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError> {
        match ch.publish(exchange, routing_key, body, properties).await? {
            PublishStatus::Accepted => {}
            PublishStatus::BufferFull => {
                warn!(
                    %exchange,
                    %routing_key,
                    "RabbitMQ outbound buffer full, waiting for drain"
                );
                ch.wait_for_drain().await?;
                debug!(%exchange, %routing_key, "RabbitMQ outbound buffer drained");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for Producer {
    async fn publish<T: serde::Serialize + Send + Sync>(
        &self,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.opts.exchange.clone());
        let routing_key = options.routing_key.clone().unwrap_or_default();

        let body = match serde_json::to_vec(message) {
            Ok(body) => body,
            Err(e) => {
                error!(%exchange, %routing_key, error = %e, "Failed to serialize message");
                return Err(e.into());
            }
        };

        let ch = self.connection.channel().await?;
        let properties = self.properties(&options);

        if let Err(e) = self
            .send(ch.as_ref(), &exchange, &routing_key, &body, &properties)
            .await
        {
            error!(%exchange, %routing_key, error = %e, "Failed to publish message");
            return Err(e);
        }

        debug!(%exchange, %routing_key, bytes = body.len(), "Message published");
        Ok(())
    }

    async fn publish_to_queue<T: serde::Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        let body = match serde_json::to_vec(message) {
            Ok(body) => body,
            Err(e) => {
                error!(%queue, error = %e, "Failed to serialize message");
                return Err(e.into());
            }
        };

        let ch = self.connection.channel().await?;

        let queue_opts = QueueOptions {
            durable: self.opts.durable,
            ..Default::default()
        };
        if let Err(e) = ch.declare_queue(queue, &queue_opts).await {
            error!(%queue, error = %e, "Failed to assert queue before publishing");
            return Err(e);
        }

        let properties = self.properties(&options);

        // default exchange, routed by queue name
        if let Err(e) = self.send(ch.as_ref(), "", queue, &body, &properties).await {
            error!(%queue, error = %e, "Failed to publish message to queue");
            return Err(e);
        }

        debug!(%queue, bytes = body.len(), "Message published to queue");
        Ok(())
    }
}
