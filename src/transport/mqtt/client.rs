//! Impure I/O operations for the rumqttc binding
//!
//! [`RumqttTransport::open`] builds an `AsyncClient`/`EventLoop` pair and spawns
//! an event pump that polls the loop, routes events through [`MessageHandler`]
//! and forwards them to the adapter as [`TransportEvent`]s. Reconnects after a
//! network error are performed here, spaced by the configured reconnect interval.

use super::connection::{configure_mqtt_options, BrokerAddress};
use super::message_handler::{EventRoute, MessageHandler, SubscribeTracker};
use crate::transport::{
    PublishOptions, QoS, ResolvedOptions, Transport, TransportConnection, TransportError,
    TransportEvent, TransportHandle,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, SubscribeFilter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `end` waits for the event pump to wind down before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Production transport backed by rumqttc
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttTransport;

impl RumqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn open(
        &self,
        address: &str,
        options: &ResolvedOptions,
    ) -> Result<TransportConnection, TransportError> {
        let broker = BrokerAddress::parse(address)?;
        let mqtt_options = configure_mqtt_options(&broker, options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, options.request_capacity);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = Arc::new(Mutex::new(SubscribeTracker::new()));

        info!(
            broker = %broker.display_url(),
            client_id = %options.client_id,
            clean_session = options.clean_session,
            "Opening MQTT connection"
        );

        let pump = EventPump {
            event_loop,
            events: events_tx,
            shutdown_rx,
            tracker: tracker.clone(),
            reconnect_interval: options.reconnect_interval,
            client_id: options.client_id.clone(),
        };
        let pump_handle = tokio::spawn(pump.run());

        let handle = RumqttHandle {
            client,
            shutdown_tx,
            tracker,
            pump: Mutex::new(Some(pump_handle)),
        };

        Ok(TransportConnection {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

/// Request handle for one rumqttc connection
pub struct RumqttHandle {
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    tracker: Arc<Mutex<SubscribeTracker>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttHandle {
    fn take_pump(&self) -> Option<JoinHandle<()>> {
        lock(&self.pump).take()
    }

    /// Wait for the pump to finish, aborting it after the grace period
    async fn join_pump(&self) {
        let Some(mut pump) = self.take_pump() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut pump).await {
            Ok(Ok(())) => debug!("MQTT event pump stopped"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT event pump ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("MQTT event pump didn't stop in time, aborting");
                pump.abort();
            }
        }
    }
}

#[async_trait]
impl TransportHandle for RumqttHandle {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let mut tracker = lock(&self.tracker);
        tracker.queue(vec![topic.to_string()]);
        if let Err(e) = self.client.try_subscribe(topic, qos) {
            tracker.cancel_last();
            return Err(TransportError::RequestRejected(Box::new(e)));
        }
        Ok(())
    }

    fn subscribe_many(&self, topics: &[String], qos: QoS) -> Result<(), TransportError> {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), qos))
            .collect();

        let mut tracker = lock(&self.tracker);
        tracker.queue(topics.to_vec());
        if let Err(e) = self.client.try_subscribe_many(filters) {
            tracker.cancel_last();
            return Err(TransportError::RequestRejected(Box::new(e)));
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::RequestRejected(Box::new(e)))
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, options.qos, options.retain, payload.to_vec())
            .map_err(|e| TransportError::RequestRejected(Box::new(e)))
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        if force {
            let _ = self.shutdown_tx.send(true);
        } else if let Err(e) = self.client.try_disconnect() {
            // Queue is full or the loop is gone; fall back to a hard stop
            debug!("Graceful disconnect not queued ({}), forcing close", e);
            let _ = self.shutdown_tx.send(true);
        }

        self.join_pump().await;
        Ok(())
    }
}

impl Drop for RumqttHandle {
    fn drop(&mut self) {
        // Async cleanup is impossible here; stop the pump so it releases the socket
        let _ = self.shutdown_tx.send(true);
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
    }
}

/// Background task that owns the rumqttc event loop
struct EventPump {
    event_loop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
    tracker: Arc<Mutex<SubscribeTracker>>,
    reconnect_interval: Duration,
    client_id: String,
}

impl EventPump {
    async fn run(mut self) {
        debug!(client_id = %self.client_id, "MQTT event pump started");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(client_id = %self.client_id, "Shutdown requested, closing MQTT connection");
                        break;
                    }
                }

                polled = self.event_loop.poll() => {
                    match polled {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !self.process_event_route(route) {
                                break;
                            }
                        }
                        Err(e) => {
                            if !self.handle_connection_error(e).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let _ = self.events.send(TransportEvent::Closed);
        info!(client_id = %self.client_id, "MQTT event pump stopped");
    }

    /// Returns true to keep polling
    fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => self.emit(TransportEvent::Connected),
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", topic = %topic, bytes = payload.len(), "Inbound message");
                self.emit(TransportEvent::Message { topic, payload })
            }
            EventRoute::SubscribeSent(packet_id) => {
                lock(&self.tracker).sent(packet_id);
                true
            }
            EventRoute::SubscriptionAcknowledged { packet_id, granted } => {
                let topics = lock(&self.tracker).acknowledged(packet_id);
                if topics.is_empty() {
                    let all_granted = !granted.is_empty() && granted.iter().all(|g| *g);
                    return self.emit(TransportEvent::SubscribeAck {
                        topic: None,
                        result: ack_result(all_granted),
                    });
                }

                topics.into_iter().enumerate().all(|(index, topic)| {
                    let accepted = granted.get(index).copied().unwrap_or(false);
                    self.emit(TransportEvent::SubscribeAck {
                        topic: Some(topic),
                        result: ack_result(accepted),
                    })
                })
            }
            EventRoute::Disconnected => {
                let keep_going =
                    self.emit(TransportEvent::Error("Broker sent DISCONNECT".to_string()));
                keep_going && !self.reconnect_interval.is_zero()
            }
            EventRoute::DisconnectSent => {
                info!(client_id = %self.client_id, "DISCONNECT sent, closing MQTT connection");
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Report the error, then wait out the reconnect interval.
    /// Returns true when the next poll should attempt a reconnect.
    async fn handle_connection_error(&mut self, error: rumqttc::ConnectionError) -> bool {
        warn!(client_id = %self.client_id, "MQTT connection error: {}", error);
        lock(&self.tracker).reset();

        if !self.emit(TransportEvent::Error(error.to_string())) {
            return false;
        }
        if self.reconnect_interval.is_zero() {
            return false;
        }

        debug!(
            "Reconnecting in {}ms",
            self.reconnect_interval.as_millis()
        );
        interruptible_sleep(self.shutdown_rx.clone(), self.reconnect_interval).await
    }

    /// Forward an event; false once the adapter has dropped the receiver
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnect delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

fn ack_result(granted: bool) -> Result<(), String> {
    if granted {
        Ok(())
    } else {
        Err("broker rejected the subscription".to_string())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
