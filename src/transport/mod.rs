//! Transport layer for broker communication
//!
//! The adapter never talks to `rumqttc` directly. It opens connections through
//! the [`Transport`] trait and drives them through [`TransportHandle`], receiving
//! [`TransportEvent`]s on a channel. This keeps the subscription bookkeeping
//! testable against [`crate::testing::MockTransport`].

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;
pub mod options;

pub use options::{ConnectOptions, Credentials, PublishOptions, ResolvedOptions};
pub use rumqttc::QoS;

/// Errors raised by a transport binding
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("Request rejected by transport: {0}")]
    RequestRejected(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Events surfaced by a live transport connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection (fires again after each reconnect)
    Connected,
    /// Network or protocol error; the binding may still be retrying
    Error(String),
    /// Inbound publish, framing already stripped
    Message { topic: String, payload: Bytes },
    /// Broker answered a subscribe request
    SubscribeAck {
        topic: Option<String>,
        result: Result<(), String>,
    },
    /// Connection is gone for good; no further events follow
    Closed,
}

/// A freshly opened connection: the request handle plus its event stream
pub struct TransportConnection {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to a broker
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting to `address`. Success here only means the attempt is
    /// underway; the outcome arrives as a `Connected` or `Error` event.
    async fn open(
        &self,
        address: &str,
        options: &ResolvedOptions,
    ) -> Result<TransportConnection, TransportError>;
}

/// Requests against one open connection
///
/// Request methods only queue work and never wait on the network, so they are
/// safe to call while holding the adapter lock.
#[async_trait::async_trait]
pub trait TransportHandle: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Subscribe several topics with a single request
    fn subscribe_many(&self, topics: &[String], qos: QoS) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Close the connection. `force` skips waiting for in-flight requests.
    async fn end(&self, force: bool) -> Result<(), TransportError>;
}

/// Map a numeric QoS level (0, 1, 2) to [`QoS`]
pub fn qos_from_level(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::InvalidOptions(format!(
            "QoS level must be 0, 1 or 2, got {other}"
        ))),
    }
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::RumqttTransport;
