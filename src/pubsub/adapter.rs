//! Public pub/sub facade
//!
//! One [`PubSubAdapter`] is meant to be constructed per process and shared
//! (typically behind an `Arc`) by every consumer. The connection is created by
//! the first `connect` and torn down by `disconnect`.

use super::manager::{ConnectionInfo, ConnectionManager, ConnectionState};
use super::registry::ListenerHandle;
use crate::error::{AdapterError, AdapterResult};
use crate::transport::{ConnectOptions, PublishOptions, QoS, Transport};
use std::sync::Arc;

/// Client-side pub/sub adapter over one shared broker connection
pub struct PubSubAdapter {
    manager: ConnectionManager,
}

impl PubSubAdapter {
    /// Adapter that subscribes with QoS 0
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_subscribe_qos(transport, QoS::AtMostOnce)
    }

    pub fn with_subscribe_qos(transport: Arc<dyn Transport>, qos: QoS) -> Self {
        Self {
            manager: ConnectionManager::new(transport, qos),
        }
    }

    /// Connect, or reuse the existing connection. See [`ConnectionManager::connect`].
    pub async fn connect(
        &self,
        broker: &str,
        options: ConnectOptions,
    ) -> AdapterResult<ConnectionInfo> {
        self.manager.connect(broker, options).await
    }

    /// Register `listener` for the exact topic `topic`.
    ///
    /// Fails with [`AdapterError::NotConnected`] when there is no connection.
    /// Only the first listener of a topic causes a broker subscribe.
    pub async fn subscribe(&self, topic: &str, listener: ListenerHandle) -> AdapterResult<()> {
        self.manager.subscribe(topic, listener).await
    }

    /// Remove `listener` from `topic`. Never fails.
    pub async fn unsubscribe(&self, topic: &str, listener: &ListenerHandle) {
        self.manager.unsubscribe(topic, listener).await
    }

    /// Publish with QoS 0, not retained
    pub async fn publish(&self, topic: &str, payload: impl AsRef<[u8]>) -> AdapterResult<()> {
        self.publish_with(topic, payload, PublishOptions::default())
            .await
    }

    pub async fn publish_with(
        &self,
        topic: &str,
        payload: impl AsRef<[u8]>,
        options: PublishOptions,
    ) -> AdapterResult<()> {
        self.manager.publish(topic, payload.as_ref(), options).await
    }

    /// Close the connection and clear all subscriptions
    pub async fn disconnect(&self) {
        self.manager.disconnect().await
    }

    /// Disconnect after queued requests have been sent
    pub async fn close(&self) {
        self.manager.close().await
    }

    /// Deliver `payload` to the listeners of `topic` without going through the broker
    pub async fn dispatch(&self, topic: &str, payload: &str) -> usize {
        self.manager.dispatch(topic, payload).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.manager.connection_state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.manager.is_connected().await
    }

    pub async fn last_error(&self) -> Option<AdapterError> {
        self.manager.last_error().await
    }

    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.manager.connection_info().await
    }

    /// Topics with at least one listener, sorted
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.manager.subscribed_topics().await
    }

    pub async fn listener_count(&self, topic: &str) -> usize {
        self.manager.listener_count(topic).await
    }
}
