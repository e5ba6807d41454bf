//! # Broker Client Layer
//!
//! Resilient RabbitMQ connections, topology declaration, and the
//! publisher/subscriber contract with explicit delivery guarantees.

pub mod connection;
pub mod message;
pub mod publisher;
pub mod settings;
pub mod subscriber;
pub mod topology;

pub use connection::{
    ConnectionHandle, ConnectionListener, ConnectionPair, ConnectionRole, HandleState,
    LogConnectionListener,
};
pub use message::{body_type, BatchMessage, QueueMessage};
pub use publisher::Publisher;
pub use settings::{QueueSettings, RabbitClientSettings, RabbitConsumerSettings};
pub use subscriber::Subscriber;
