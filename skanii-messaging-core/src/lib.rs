pub mod bus;
pub mod error;
pub mod handler;
pub mod telemetry;
pub mod types;

pub use bus::{MessagePublisher, MessageSubscriber};
pub use error::MessagingError;
pub use handler::{Acknowledger, MessageHandler};
pub use types::{
    ConsumeOptions, Delivery, ExchangeType, MessageProperties, PublishOptions, QueueOptions,
    Subscription, JSON_CONTENT_TYPE,
};
