//! rumqttc binding for the [`Transport`](crate::transport::Transport) trait
//!
//! # Architecture
//!
//! - [`connection`] - Pure broker address parsing and option translation
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`client`] - Impure I/O: the event pump and request handle
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_playground::pubsub::PubSubAdapter;
//! use mqtt_playground::transport::{ConnectOptions, MqttTransport};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let adapter = PubSubAdapter::new(Arc::new(MqttTransport::new()));
//! adapter
//!     .connect("mqtt://localhost:1883", ConnectOptions::new())
//!     .await?;
//! adapter.publish("playground/hello", "hi").await?;
//! adapter.disconnect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttHandle, RumqttTransport};
pub use connection::{configure_mqtt_options, BrokerAddress, BrokerScheme};
pub use message_handler::{EventRoute, MessageHandler, SubscribeTracker};
