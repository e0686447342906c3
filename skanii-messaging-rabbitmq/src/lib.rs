mod connection;
mod consumer;
mod options;
mod producer;
mod registry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::Consumer;
pub use options::{RabbitMqOptions, DEFAULT_EXCHANGE, DEFAULT_URI};
pub use producer::Producer;
pub use registry::SubscriptionRegistry;
pub use transport::LapinTransport;
