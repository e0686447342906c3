use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use skanii_messaging_core::{
    Acknowledger, ConsumeOptions, Delivery, MessageHandler, MessageSubscriber, MessagingError,
    Subscription,
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{ConnectionManager, ConnectionState},
    options::RabbitMqOptions,
    registry::SubscriptionRegistry,
    transport::{DeliveryStream, LapinTransport, Transport, TransportChannel},
};

/// Subscribes handlers to queues with explicit acknowledgement.
///
/// Each subscription runs its own delivery loop; deliveries of one
/// subscription are handled one at a time, bounded by the prefetch window.
#[derive(Clone)]
pub struct Consumer {
    opts: Arc<RabbitMqOptions>,
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
}

impl Consumer {
    pub fn new(opts: RabbitMqOptions) -> Self {
        let transport = Arc::new(LapinTransport::from_options(&opts));
        Self::with_transport(opts, transport)
    }

    pub fn with_transport(opts: RabbitMqOptions, transport: Arc<dyn Transport>) -> Self {
        let opts = Arc::new(opts);
        let registry = Arc::new(SubscriptionRegistry::new());
        Self {
            connection: ConnectionManager::for_consumer(
                Arc::clone(&opts),
                transport,
                Arc::clone(&registry),
            ),
            registry,
            opts,
        }
    }

    pub fn options(&self) -> &RabbitMqOptions {
        &self.opts
    }

    pub async fn connect(&self) -> Result<(), MessagingError> {
        self.connection.connect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn active_consumers(&self) -> Vec<Subscription> {
        self.registry.snapshot()
    }

    /// Acknowledges `message`, or every outstanding delivery up to it.
    /// No-op without a live channel.
    pub async fn ack(&self, message: &Delivery, all_up_to: bool) -> Result<(), MessagingError> {
        match self.connection.current_channel().await {
            Some(ch) => ch.ack(message.delivery_tag, all_up_to).await,
            None => {
                debug!(delivery_tag = message.delivery_tag, "ack dropped, no channel");
                Ok(())
            }
        }
    }

    pub async fn nack(&self, message: &Delivery, requeue: bool) -> Result<(), MessagingError> {
        match self.connection.current_channel().await {
            Some(ch) => ch.nack(message.delivery_tag, false, requeue).await,
            None => {
                debug!(delivery_tag = message.delivery_tag, "nack dropped, no channel");
                Ok(())
            }
        }
    }

    pub async fn reject(&self, message: &Delivery, requeue: bool) -> Result<(), MessagingError> {
        match self.connection.current_channel().await {
            Some(ch) => ch.reject(message.delivery_tag, requeue).await,
            None => {
                debug!(delivery_tag = message.delivery_tag, "reject dropped, no channel");
                Ok(())
            }
        }
    }

    /// Stops every registered subscription, then closes channel and
    /// connection. After an error the client state is indeterminate.
    pub async fn close(&self) -> Result<(), MessagingError> {
        for queue in self.registry.queues() {
            if let Err(e) = self.stop_consuming(&queue).await {
                error!(%queue, error = %e, "Failed to stop consumer while closing");
                return Err(e);
            }
        }
        self.connection.close().await
    }

    async fn declare_and_bind(
        &self,
        ch: &dyn TransportChannel,
        options: &ConsumeOptions,
    ) -> Result<(), MessagingError> {
        let queue = &options.queue;
        ch.declare_queue(queue, &options.queue_options(self.opts.durable))
            .await?;

        for rk in options.binding_keys() {
            ch.bind_queue(queue, &self.opts.exchange, rk).await?;
            debug!(%queue, exchange = %self.opts.exchange, routing_key = rk, "Queue bound");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSubscriber for Consumer {
    async fn consume(
        &self,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String, MessagingError> {
        let ch = self.connection.channel().await?;
        let queue = options.queue.clone();

        if let Err(e) = self.declare_and_bind(ch.as_ref(), &options).await {
            error!(%queue, exchange = %self.opts.exchange, error = %e, "Failed to set up queue");
            return Err(e);
        }

        let requested_tag = options.consumer_tag.clone().unwrap_or_default();
        let (tag, stream) = match ch.consume(&queue, &requested_tag, options.no_ack).await {
            Ok(started) => started,
            Err(e) => {
                error!(%queue, error = %e, "Failed to start consuming");
                return Err(e);
            }
        };

        if let Some(previous) = self.registry.insert(&queue, &tag) {
            warn!(%queue, consumer_tag = %previous, "Replacing active subscription on queue");
            if let Err(e) = ch.cancel(&previous).await {
                warn!(%queue, consumer_tag = %previous, error = %e, "Failed to cancel replaced subscription");
            }
        }

        tokio::spawn(delivery_loop(
            Arc::clone(&ch),
            stream,
            handler,
            queue.clone(),
            tag.clone(),
            options.no_ack,
        ));

        info!(
            "Consuming queue={} exchange={} consumer_tag={}",
            queue, self.opts.exchange, tag
        );
        Ok(tag)
    }

    async fn stop_consuming(&self, queue: &str) -> Result<(), MessagingError> {
        let Some(tag) = self.registry.get(queue) else {
            warn!(%queue, "No active consumer for queue");
            return Ok(());
        };

        if let Some(ch) = self.connection.current_channel().await {
            if let Err(e) = ch.cancel(&tag).await {
                error!(%queue, consumer_tag = %tag, error = %e, "Failed to cancel consumer");
                return Err(e);
            }
        }

        self.registry.remove_if(queue, &tag);
        info!(%queue, consumer_tag = %tag, "Stopped consuming");
        Ok(())
    }
}

async fn delivery_loop(
    ch: Arc<dyn TransportChannel>,
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    queue: String,
    consumer_tag: String,
    no_ack: bool,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Some(delivery)) => {
                process_delivery(&ch, &delivery, handler.as_ref(), &queue, no_ack).await;
            }
            Ok(None) => {
                debug!(%queue, %consumer_tag, "Received null delivery, ignoring");
            }
            Err(e) => {
                error!(%queue, %consumer_tag, error = %e, "delivery error");
                break;
            }
        }
    }
    debug!(%queue, %consumer_tag, "Delivery loop finished");
}

async fn process_delivery(
    ch: &Arc<dyn TransportChannel>,
    delivery: &Delivery,
    handler: &dyn MessageHandler,
    queue: &str,
    no_ack: bool,
) {
    let acker = DeliveryAcker::new(Arc::clone(ch), delivery.delivery_tag, no_ack);
    let message_id = delivery.message_id().unwrap_or("-");

    match handler.handle(delivery, &acker).await {
        Ok(()) => {
            if no_ack || acker.is_settled() {
                return;
            }
            if let Err(e) = acker.ack().await {
                error!(%queue, %message_id, error = %e, "Failed to acknowledge message");
            }
        }
        Err(err) => {
            error!(%queue, %message_id, error = %err, "Error processing message");
            if no_ack || acker.is_settled() {
                return;
            }
            if let Err(e) = acker.nack(true).await {
                error!(%queue, %message_id, error = %e, "Failed to requeue message");
            }
        }
    }
}

/// Settles a single delivery on the channel it arrived on.
struct DeliveryAcker {
    ch: Arc<dyn TransportChannel>,
    delivery_tag: u64,
    no_ack: bool,
    settled: AtomicBool,
}

impl DeliveryAcker {
    fn new(ch: Arc<dyn TransportChannel>, delivery_tag: u64, no_ack: bool) -> Self {
        Self {
            ch,
            delivery_tag,
            no_ack,
            settled: AtomicBool::new(false),
        }
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// True for the first caller only.
    fn settle(&self, op: &str) -> bool {
        if self.no_ack {
            debug!(delivery_tag = self.delivery_tag, op, "no_ack subscription, nothing to settle");
            return false;
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            warn!(delivery_tag = self.delivery_tag, op, "Delivery already settled, ignoring");
            return false;
        }
        true
    }
}

#[async_trait]
impl Acknowledger for DeliveryAcker {
    async fn ack(&self) -> Result<(), MessagingError> {
        if !self.settle("ack") {
            return Ok(());
        }
        self.ch.ack(self.delivery_tag, false).await
    }

    async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        if !self.settle("nack") {
            return Ok(());
        }
        self.ch.nack(self.delivery_tag, false, requeue).await
    }

    async fn reject(&self, requeue: bool) -> Result<(), MessagingError> {
        if !self.settle("reject") {
            return Ok(());
        }
        self.ch.reject(self.delivery_tag, requeue).await
    }
}
