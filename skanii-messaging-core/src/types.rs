// skanii-messaging-core/src/types.rs
use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::MessagingError;

/// Content type stamped on every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Routing model of the declared exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    #[default]
    Topic,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "topic" => Ok(ExchangeType::Topic),
            "fanout" => Ok(ExchangeType::Fanout),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(MessagingError::Config(format!(
                "unknown exchange type '{other}'"
            ))),
        }
    }
}

/// Properties carried next to a payload, both on publish and on delivery.
///
/// `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub timestamp: Option<u64>,
    pub persistent: bool,
    pub headers: BTreeMap<String, Value>,
}

/// Per-call overrides for `publish` / `publish_to_queue`.
///
/// Unset fields fall back to the client configuration: empty routing key,
/// the configured exchange, persistent delivery and the current time.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub routing_key: Option<String>,
    pub exchange: Option<String>,
    pub persistent: Option<bool>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub timestamp: Option<u64>,
    pub headers: BTreeMap<String, Value>,
}

impl PublishOptions {
    pub fn routed(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(routing_key.into()),
            ..Default::default()
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_timestamp(mut self, epoch_ms: u64) -> Self {
        self.timestamp = Some(epoch_ms);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, Value>,
}

/// What `consume` declares, binds and subscribes to.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub queue: String,
    /// Empty list binds once with an empty routing key.
    pub routing_keys: Vec<String>,
    /// `None` uses the client's configured durability.
    pub durable: Option<bool>,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, Value>,
    pub no_ack: bool,
    /// `None` lets the broker generate the subscription tag.
    pub consumer_tag: Option<String>,
}

impl ConsumeOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn with_routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    /// Queue flags resolved against the client default durability.
    pub fn queue_options(&self, default_durable: bool) -> QueueOptions {
        QueueOptions {
            durable: self.durable.unwrap_or(default_durable),
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: self.arguments.clone(),
        }
    }

    /// Routing keys to bind, `[""]` when none were given.
    pub fn binding_keys(&self) -> Vec<&str> {
        if self.routing_keys.is_empty() {
            vec![""]
        } else {
            self.routing_keys.iter().map(String::as_str).collect()
        }
    }
}

/// A message handed to a consumer handler.
///
/// `delivery_tag` is scoped to the channel the message arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl Delivery {
    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    /// Decodes the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.payload).map_err(MessagingError::from)
    }
}

/// An active `queue -> subscription tag` registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub queue: String,
    pub consumer_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exchange_type_parses_case_insensitively() {
        assert_eq!("Fanout".parse::<ExchangeType>().unwrap(), ExchangeType::Fanout);
        assert_eq!(" topic ".parse::<ExchangeType>().unwrap(), ExchangeType::Topic);
        assert!("x-delayed".parse::<ExchangeType>().is_err());
        assert_eq!(ExchangeType::default(), ExchangeType::Topic);
    }

    #[test]
    fn empty_routing_keys_bind_once_with_empty_key() {
        let opts = ConsumeOptions::new("uploads");
        assert_eq!(opts.binding_keys(), vec![""]);

        let opts = opts.with_routing_keys(["upload.created", "upload.deleted"]);
        assert_eq!(opts.binding_keys(), vec!["upload.created", "upload.deleted"]);
    }

    #[test]
    fn queue_options_fall_back_to_default_durability() {
        let opts = ConsumeOptions::new("q").with_argument("x-max-priority", 5);
        let resolved = opts.queue_options(true);
        assert!(resolved.durable);
        assert!(!resolved.exclusive);
        assert!(!resolved.auto_delete);
        assert_eq!(resolved.arguments.get("x-max-priority"), Some(&json!(5)));

        let resolved = opts.with_durable(false).queue_options(true);
        assert!(!resolved.durable);
    }

    #[test]
    fn delivery_decodes_json_payload() {
        let delivery = Delivery {
            delivery_tag: 1,
            exchange: "skanii".into(),
            routing_key: "scan.done".into(),
            redelivered: false,
            payload: br#"{"a":1}"#.to_vec(),
            properties: MessageProperties {
                message_id: Some("m-1".into()),
                correlation_id: Some("scan-7".into()),
                ..Default::default()
            },
        };

        let value: Value = delivery.json().unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(delivery.message_id(), Some("m-1"));
        assert_eq!(delivery.correlation_id(), Some("scan-7"));
        assert!(delivery.json::<Vec<u8>>().is_err());
    }
}
