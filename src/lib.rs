//! MQTT Playground
//!
//! A small toolkit for exercising an MQTT broker: connect, subscribe to topics,
//! watch incoming messages and publish messages.
//!
//! # Overview
//!
//! - [`pubsub`] - the client-side pub/sub adapter: one shared connection, a
//!   topic to listener registry, reference-counted broker subscriptions and
//!   fan-out of inbound messages
//! - [`transport`] - the transport seam and its `rumqttc` binding
//! - [`console`] - a session keeping message history and subscribed topics
//! - [`config`] - TOML configuration
//! - [`observability`] - logging setup
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_playground::pubsub::{listener, PubSubAdapter};
//! use mqtt_playground::testing::MockTransport;
//! use mqtt_playground::transport::ConnectOptions;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(MockTransport::new());
//! let adapter = PubSubAdapter::new(transport.clone());
//! adapter.connect("mqtt://localhost:1883", ConnectOptions::new()).await?;
//!
//! let printer = listener(|payload: &str, topic: &str| println!("{topic}: {payload}"));
//! adapter.subscribe("sensors/temp", printer.clone()).await?;
//! adapter.dispatch("sensors/temp", "21.5").await;
//!
//! adapter.unsubscribe("sensors/temp", &printer).await;
//! adapter.disconnect().await;
//! # Ok::<(), mqtt_playground::AdapterError>(())
//! # });
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod observability;
pub mod pubsub;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, PlaygroundConfig};
pub use console::{ConsoleSession, InboundMessage};
pub use error::{AdapterError, AdapterResult};
pub use pubsub::{ConnectionInfo, ConnectionState, ListenerHandle, MessageListener, PubSubAdapter};
pub use transport::{ConnectOptions, MqttTransport, PublishOptions, QoS};
