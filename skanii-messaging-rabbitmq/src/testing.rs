//! Recording in-memory transport for unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use skanii_messaging_core::{
    Delivery, ExchangeType, MessageProperties, MessagingError, QueueOptions,
};
use tokio::{
    sync::{mpsc, Notify},
    time::sleep,
};

use crate::transport::{
    DeliveryStream, PublishStatus, Transport, TransportChannel, TransportConnection,
    TransportEvent, TransportEvents,
};

type DeliverySender = mpsc::UnboundedSender<Result<Option<Delivery>, MessagingError>>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Connect(String),
    CreateChannel,
    DeclareExchange {
        name: String,
        kind: ExchangeType,
        durable: bool,
    },
    Prefetch(u16),
    DeclareQueue {
        name: String,
        options: QueueOptions,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        properties: MessageProperties,
    },
    WaitForDrain,
    Consume {
        queue: String,
        no_ack: bool,
    },
    Cancel(String),
    Ack {
        tag: u64,
        multiple: bool,
    },
    Nack {
        tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Reject {
        tag: u64,
        requeue: bool,
    },
    CloseChannel,
    CloseConnection,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<Call>>,
    connects: AtomicUsize,
    connect_delay_ms: AtomicU64,
    fail_connect: AtomicBool,
    fail_bind: AtomicBool,
    fail_publish: AtomicBool,
    fail_cancel: AtomicBool,
    buffer_full: AtomicBool,
    drained: Notify,
    events: Mutex<Vec<Option<TransportEvents>>>,
    subscriptions: Mutex<HashMap<String, DeliverySender>>,
    tag_seq: AtomicUsize,
}

impl MockState {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_bind(&self, fail: bool) {
        self.state.fail_bind.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_cancel(&self, fail: bool) {
        self.state.fail_cancel.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_buffer_full(&self, full: bool) {
        self.state.buffer_full.store(full, Ordering::SeqCst);
    }

    /// Empties the outbound buffer and fires the drain signal.
    pub(crate) fn release_drain(&self) {
        self.state.buffer_full.store(false, Ordering::SeqCst);
        self.state.drained.notify_waiters();
    }

    /// Reports an asynchronous event on the `index`-th opened connection.
    pub(crate) fn emit(&self, index: usize, event: TransportEvent) -> bool {
        let events = self.state.events.lock().unwrap();
        match events.get(index).and_then(Option::as_ref) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn deliver(&self, consumer_tag: &str, delivery: Delivery) {
        self.push(consumer_tag, Ok(Some(delivery)));
    }

    /// Sends the `None` cancellation signal some brokers emit.
    pub(crate) fn deliver_cancel_signal(&self, consumer_tag: &str) {
        self.push(consumer_tag, Ok(None));
    }

    fn push(&self, consumer_tag: &str, item: Result<Option<Delivery>, MessagingError>) {
        let subs = self.state.subscriptions.lock().unwrap();
        let tx = subs.get(consumer_tag).expect("unknown consumer tag");
        tx.send(item).expect("delivery stream closed");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        uri: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportConnection>, MessagingError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.record(Call::Connect(uri.to_string()));

        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(MessagingError::Connection("ECONNREFUSED".into()));
        }

        let mut all = self.state.events.lock().unwrap();
        all.push(Some(events));
        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            index: all.len() - 1,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    index: usize,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, MessagingError> {
        self.state.record(Call::CreateChannel);
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.state.record(Call::CloseConnection);
        if let Some(slot) = self.state.events.lock().unwrap().get_mut(self.index) {
            slot.take();
        }
        Ok(())
    }
}

struct MockChannel {
    state: Arc<MockState>,
}

#[async_trait]
impl TransportChannel for MockChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), MessagingError> {
        self.state.record(Call::DeclareExchange {
            name: name.to_string(),
            kind,
            durable,
        });
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), MessagingError> {
        self.state.record(Call::DeclareQueue {
            name: name.to_string(),
            options: options.clone(),
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        if self.state.fail_bind.load(Ordering::SeqCst) {
            return Err(MessagingError::Subscribe("NOT_FOUND - no exchange".into()));
        }
        self.state.record(Call::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.state.record(Call::Prefetch(count));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishStatus, MessagingError> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(MessagingError::Publish("channel closed".into()));
        }
        self.state.record(Call::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });
        if self.state.buffer_full.load(Ordering::SeqCst) {
            Ok(PublishStatus::BufferFull)
        } else {
            Ok(PublishStatus::Accepted)
        }
    }

    async fn wait_for_drain(&self) -> Result<(), MessagingError> {
        self.state.record(Call::WaitForDrain);
        loop {
            let notified = self.state.drained.notified();
            if !self.state.buffer_full.load(Ordering::SeqCst) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(String, DeliveryStream), MessagingError> {
        self.state.record(Call::Consume {
            queue: queue.to_string(),
            no_ack,
        });

        let tag = if consumer_tag.is_empty() {
            let n = self.state.tag_seq.fetch_add(1, Ordering::SeqCst) + 1;
            format!("amq.ctag-{n}")
        } else {
            consumer_tag.to_string()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .subscriptions
            .lock()
            .unwrap()
            .insert(tag.clone(), tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok((tag, stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        if self.state.fail_cancel.load(Ordering::SeqCst) {
            return Err(MessagingError::Subscribe("channel closed".into()));
        }
        self.state.record(Call::Cancel(consumer_tag.to_string()));
        self.state.subscriptions.lock().unwrap().remove(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), MessagingError> {
        self.state.record(Call::Ack {
            tag: delivery_tag,
            multiple,
        });
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), MessagingError> {
        self.state.record(Call::Nack {
            tag: delivery_tag,
            multiple,
            requeue,
        });
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.state.record(Call::Reject {
            tag: delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.state.record(Call::CloseChannel);
        Ok(())
    }
}

pub(crate) fn delivery(tag: u64, payload: &[u8]) -> Delivery {
    Delivery {
        delivery_tag: tag,
        exchange: "skanii".into(),
        routing_key: "scan.requested".into(),
        redelivered: false,
        payload: payload.to_vec(),
        properties: MessageProperties {
            message_id: Some(format!("msg-{tag}")),
            ..Default::default()
        },
    }
}

/// Polls `cond` until it holds, panicking after two seconds.
pub(crate) async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
