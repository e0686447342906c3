use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use serde_json::{json, Map, Value};
use skanii_messaging_core::{
    Delivery, ExchangeType, MessageProperties, MessagingError, QueueOptions,
};
use tokio::sync::Notify;
use tracing::warn;

use super::{
    DeliveryStream, PublishStatus, Transport, TransportChannel, TransportConnection,
    TransportEvent, TransportEvents,
};
use crate::options::RabbitMqOptions;

/// `Transport` over lapin (AMQP 0.9.1).
#[derive(Clone, Debug)]
pub struct LapinTransport {
    confirms: bool,
    publish_buffer: usize,
}

impl LapinTransport {
    pub fn new(confirms: bool, publish_buffer: usize) -> Self {
        Self {
            confirms,
            publish_buffer: publish_buffer.max(1),
        }
    }

    pub fn from_options(opts: &RabbitMqOptions) -> Self {
        Self::new(opts.confirms, opts.publish_buffer)
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        uri: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportConnection>, MessagingError> {
        let conn = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        conn.on_error(move |err| {
            let event = match &err {
                lapin::Error::InvalidConnectionState(_) => TransportEvent::Closed(err.to_string()),
                _ => TransportEvent::Error(err.to_string()),
            };
            let _ = events.send(event);
        });

        Ok(Arc::new(LapinConnection {
            conn,
            confirms: self.confirms,
            publish_buffer: self.publish_buffer,
        }))
    }
}

struct LapinConnection {
    conn: Connection,
    confirms: bool,
    publish_buffer: usize,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, MessagingError> {
        let ch = self
            .conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        if self.confirms {
            ch.confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| MessagingError::Connection(e.to_string()))?;
        }

        Ok(Arc::new(LapinChannel {
            ch,
            confirms: self.confirms,
            publish_buffer: self.publish_buffer,
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.conn
            .close(200, "client closing")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

struct LapinChannel {
    ch: Channel,
    confirms: bool,
    publish_buffer: usize,
    // publishes still waiting for a broker confirm
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), MessagingError> {
        self.ch
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), MessagingError> {
        self.ch
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    nowait: false,
                    passive: false,
                },
                to_field_table(&options.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Subscribe(e.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.ch
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.ch
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishStatus, MessagingError> {
        let confirm = self
            .ch
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        if !self.confirms {
            return Ok(PublishStatus::Accepted);
        }

        let pending = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = Arc::clone(&self.in_flight);
        let drained = Arc::clone(&self.drained);
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        tokio::spawn(async move {
            match confirm.await {
                Ok(c) if c.is_nack() => {
                    warn!(%exchange, %routing_key, "publisher confirm NACK");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%exchange, %routing_key, error = %e, "publisher confirm failed");
                }
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
            drained.notify_waiters();
        });

        if pending >= self.publish_buffer {
            Ok(PublishStatus::BufferFull)
        } else {
            Ok(PublishStatus::Accepted)
        }
    }

    async fn wait_for_drain(&self) -> Result<(), MessagingError> {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) < self.publish_buffer {
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
        let consumer = self
            .ch
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    exclusive: false,
                    nowait: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        let tag = consumer.tag().as_str().to_string();
        let stream = consumer
            .map(|delivery| {
                delivery
                    .map(|d| Some(into_delivery(d)))
                    .map_err(|e| MessagingError::Subscribe(e.to_string()))
            })
            .boxed();

        Ok((tag, stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.ch
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), MessagingError> {
        self.ch
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), MessagingError> {
        self.ch
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.ch
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.ch
            .close(200, "client closing")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn to_basic_properties(p: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default().with_delivery_mode(if p.persistent { 2 } else { 1 });

    if let Some(v) = &p.content_type {
        props = props.with_content_type(v.clone().into());
    }
    if let Some(v) = &p.message_id {
        props = props.with_message_id(v.clone().into());
    }
    if let Some(v) = &p.correlation_id {
        props = props.with_correlation_id(v.clone().into());
    }
    if let Some(v) = &p.reply_to {
        props = props.with_reply_to(v.clone().into());
    }
    if let Some(v) = &p.expiration {
        props = props.with_expiration(v.clone().into());
    }
    if let Some(v) = p.priority {
        props = props.with_priority(v);
    }
    if let Some(v) = p.timestamp {
        props = props.with_timestamp(v);
    }
    if !p.headers.is_empty() {
        props = props.with_headers(to_field_table(&p.headers));
    }
    props
}

fn into_delivery(d: lapin::message::Delivery) -> Delivery {
    let p = &d.properties;
    let text = |v: &Option<lapin::types::ShortString>| v.as_ref().map(|s| s.as_str().to_string());

    let properties = MessageProperties {
        message_id: text(p.message_id()),
        correlation_id: text(p.correlation_id()),
        reply_to: text(p.reply_to()),
        expiration: text(p.expiration()),
        content_type: text(p.content_type()),
        priority: *p.priority(),
        timestamp: *p.timestamp(),
        persistent: *p.delivery_mode() == Some(2),
        headers: p
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    };

    Delivery {
        delivery_tag: d.delivery_tag,
        exchange: d.exchange.as_str().to_string(),
        routing_key: d.routing_key.as_str().to_string(),
        redelivered: d.redelivered,
        payload: d.data,
        properties,
    }
}

fn to_field_table(entries: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (k, v) in entries {
        table.insert(k.clone().into(), to_amqp_value(v));
    }
    table
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(items.iter().map(to_amqp_value).collect::<Vec<_>>().into())
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (k, v) in map {
                table.insert(k.clone().into(), to_amqp_value(v));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn from_field_table(table: &FieldTable) -> BTreeMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), from_amqp_value(v)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(v) => json!(v),
        AMQPValue::ShortShortUInt(v) => json!(v),
        AMQPValue::ShortInt(v) => json!(v),
        AMQPValue::ShortUInt(v) => json!(v),
        AMQPValue::LongInt(v) => json!(v),
        AMQPValue::LongUInt(v) => json!(v),
        AMQPValue::LongLongInt(v) => json!(v),
        AMQPValue::Float(v) => json!(v),
        AMQPValue::Double(v) => json!(v),
        AMQPValue::Timestamp(v) => json!(v),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            from_field_table(table).into_iter().collect::<Map<String, Value>>(),
        ),
        _ => Value::Null,
    }
}
