//! Shared connection lifecycle
//!
//! [`ConnectionManager`] owns at most one transport connection and the
//! subscription registry that rides on it. Both live behind one async mutex
//! together with the connection state and the last recorded error. Each opened
//! connection gets a generation number; its event task checks the number before
//! touching shared state, so a stale task can never clobber a newer connection.

use super::registry::{ListenerHandle, Registration, Removal, SubscriptionRegistry};
use crate::error::{sanitize_error_message, AdapterError, AdapterResult};
use crate::transport::{
    ConnectOptions, PublishOptions, QoS, Transport, TransportEvent, TransportHandle,
};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Lifecycle state of the shared connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Transport reported an error; it may still be retrying in the background
    ClosedWithError(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::ClosedWithError(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// What callers learn about the shared connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_id: String,
    /// Broker address with credentials redacted
    pub broker: String,
}

#[derive(Debug, Clone)]
enum ConnectOutcome {
    Pending,
    Connected(ConnectionInfo),
    Failed(AdapterError),
}

/// What `connect` found when it took the lock
enum Existing {
    Reuse(ConnectionInfo),
    Join(watch::Receiver<ConnectOutcome>),
    Replace,
    Absent,
}

struct Connection {
    generation: u64,
    handle: Arc<dyn TransportHandle>,
    info: ConnectionInfo,
    outcome: watch::Sender<ConnectOutcome>,
    ever_connected: bool,
    events_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Settle waiting `connect` callers if they are still waiting
    fn settle(&self, outcome: ConnectOutcome) {
        self.outcome.send_if_modified(|current| {
            if matches!(current, ConnectOutcome::Pending) {
                *current = outcome;
                true
            } else {
                false
            }
        });
    }

    /// End the transport. Without `force`, queued requests are sent first.
    async fn shut_down(mut self, force: bool) {
        self.settle(ConnectOutcome::Failed(AdapterError::connection(
            "connection closed before it was established",
        )));
        if let Err(e) = self.handle.end(force).await {
            warn!(generation = self.generation, "Error ending transport connection: {}", e);
        }
        if let Some(task) = self.events_task.take() {
            task.abort();
        }
    }
}

struct Shared {
    connection: Option<Connection>,
    registry: SubscriptionRegistry,
    state: ConnectionState,
    last_error: Option<AdapterError>,
    next_generation: u64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
    }

    /// Drop the current connection and everything subscribed on it
    fn discard(&mut self) -> Option<Connection> {
        self.registry.clear();
        self.connection.take()
    }

    /// Apply a non-message event from the current connection.
    /// Returns the connection when the event ended it.
    fn apply(&mut self, event: TransportEvent) -> Option<Connection> {
        match event {
            TransportEvent::Connected => {
                let connection = self.connection.as_mut()?;
                let reconnect = connection.ever_connected;
                connection.ever_connected = true;
                connection.settle(ConnectOutcome::Connected(connection.info.clone()));
                self.state = ConnectionState::Connected;
                self.last_error = None;

                if reconnect {
                    info!(
                        broker = %connection.info.broker,
                        topics = self.registry.len(),
                        "Reconnected, restoring subscriptions"
                    );
                    if let Some(error) = self.registry.resubscribe_all(&*connection.handle) {
                        self.last_error = Some(error);
                    }
                } else {
                    info!(
                        broker = %connection.info.broker,
                        client_id = %connection.info.client_id,
                        "Connected to MQTT broker"
                    );
                }
                None
            }
            TransportEvent::Error(message) => {
                let error = AdapterError::connection(&message);
                warn!("Connection error: {}", error);
                self.state = ConnectionState::ClosedWithError(sanitize_error_message(&message));
                self.last_error = Some(error.clone());

                let never_connected = self
                    .connection
                    .as_ref()
                    .is_some_and(|connection| !connection.ever_connected);
                if !never_connected {
                    return None;
                }

                let connection = self.discard();
                if let Some(connection) = &connection {
                    connection.settle(ConnectOutcome::Failed(error));
                }
                connection
            }
            TransportEvent::SubscribeAck { topic, result } => {
                let topic = topic.unwrap_or_else(|| "<unknown>".to_string());
                match result {
                    Ok(()) => debug!(topic = %topic, "Subscription acknowledged"),
                    Err(reason) => {
                        let error = AdapterError::subscribe(topic, reason);
                        warn!("{}", error);
                        self.last_error = Some(error);
                    }
                }
                None
            }
            TransportEvent::Closed => {
                info!("Transport connection closed");
                if !matches!(self.state, ConnectionState::ClosedWithError(_)) {
                    self.state = ConnectionState::Disconnected;
                }
                self.discard()
            }
            TransportEvent::Message { .. } => None,
        }
    }
}

/// Consume events for one connection until it closes or is replaced
async fn run_events(
    shared: Weak<Mutex<Shared>>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        if let TransportEvent::Message { topic, payload } = event {
            let dispatch = {
                let guard = shared.lock().await;
                if !guard.is_current(generation) {
                    break;
                }
                guard.registry.snapshot(&topic)
            };
            // Listeners run without the lock so they may call back into the adapter
            let text = String::from_utf8_lossy(&payload);
            let delivered = dispatch.deliver(&text);
            debug!(topic = %topic, delivered, "Dispatched inbound message");
            continue;
        }

        let ended = {
            let mut guard = shared.lock().await;
            if !guard.is_current(generation) {
                break;
            }
            guard.apply(event)
        };

        if let Some(mut connection) = ended {
            // This task is the connection's event task; don't abort it
            connection.events_task = None;
            connection.shut_down(true).await;
            break;
        }
    }

    debug!(generation, "Event task finished");
}

/// Owns the single shared connection and its subscription registry
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    shared: Arc<Mutex<Shared>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, subscribe_qos: QoS) -> Self {
        Self {
            transport,
            shared: Arc::new(Mutex::new(Shared {
                connection: None,
                registry: SubscriptionRegistry::new(subscribe_qos),
                state: ConnectionState::Disconnected,
                last_error: None,
                next_generation: 1,
            })),
        }
    }

    /// Connect to `broker`, or join the connection that already exists.
    ///
    /// A live connection is returned as is. A connection still being established
    /// is joined. A connection in the error state is torn down and reopened.
    /// Resolves once the transport reports the connection established and fails
    /// with [`AdapterError::Connection`] if it reports an error first.
    pub async fn connect(
        &self,
        broker: &str,
        options: ConnectOptions,
    ) -> AdapterResult<ConnectionInfo> {
        let span = crate::lifecycle_span!(
            operation = "connect",
            broker = %sanitize_error_message(broker)
        );
        self.connect_inner(broker, options).instrument(span).await
    }

    async fn connect_inner(
        &self,
        broker: &str,
        options: ConnectOptions,
    ) -> AdapterResult<ConnectionInfo> {
        let (opened, stale) = {
            let mut shared = self.shared.lock().await;

            let existing = match &shared.connection {
                Some(connection) => match shared.state {
                    ConnectionState::Connected => Existing::Reuse(connection.info.clone()),
                    ConnectionState::Connecting => Existing::Join(connection.outcome.subscribe()),
                    ConnectionState::Disconnected | ConnectionState::ClosedWithError(_) => {
                        Existing::Replace
                    }
                },
                None => Existing::Absent,
            };

            match existing {
                Existing::Reuse(info) => {
                    debug!("Already connected, reusing connection");
                    return Ok(info);
                }
                Existing::Join(outcome) => {
                    debug!("Connection attempt in flight, joining it");
                    (Ok(outcome), None)
                }
                Existing::Replace => {
                    info!("Replacing failed connection");
                    let stale = shared.discard();
                    (self.open(&mut shared, broker, options).await, stale)
                }
                Existing::Absent => (self.open(&mut shared, broker, options).await, None),
            }
        };

        if let Some(stale) = stale {
            stale.shut_down(true).await;
        }

        let mut outcome = opened?;
        loop {
            match &*outcome.borrow_and_update() {
                ConnectOutcome::Connected(info) => return Ok(info.clone()),
                ConnectOutcome::Failed(error) => return Err(error.clone()),
                ConnectOutcome::Pending => {}
            }
            if outcome.changed().await.is_err() {
                return Err(AdapterError::connection(
                    "connection dropped before it was established",
                ));
            }
        }
    }

    /// Open a new connection and start its event task; called with the lock held
    async fn open(
        &self,
        shared: &mut Shared,
        broker: &str,
        options: ConnectOptions,
    ) -> AdapterResult<watch::Receiver<ConnectOutcome>> {
        let resolved = options.resolve();
        let connection = match self.transport.open(broker, &resolved).await {
            Ok(connection) => connection,
            Err(e) => {
                let error = AdapterError::from(e);
                warn!("Failed to open connection: {}", error);
                shared.state = ConnectionState::Disconnected;
                shared.last_error = Some(error.clone());
                return Err(error);
            }
        };

        let generation = shared.next_generation;
        shared.next_generation += 1;

        let (outcome_tx, outcome_rx) = watch::channel(ConnectOutcome::Pending);
        let events_task = tokio::spawn(
            run_events(Arc::downgrade(&self.shared), generation, connection.events)
                .instrument(crate::mqtt_span!(operation = "connection_events", generation)),
        );

        shared.state = ConnectionState::Connecting;
        shared.connection = Some(Connection {
            generation,
            handle: connection.handle,
            info: ConnectionInfo {
                client_id: resolved.client_id,
                broker: sanitize_error_message(broker),
            },
            outcome: outcome_tx,
            ever_connected: false,
            events_task: Some(events_task),
        });

        Ok(outcome_rx)
    }

    /// Force the connection closed and forget every subscription. No-op when
    /// there is no connection.
    pub async fn disconnect(&self) {
        self.end(true).await
    }

    /// Like [`disconnect`](Self::disconnect), but requests already queued
    /// (e.g. a publish) are sent before the DISCONNECT packet.
    pub async fn close(&self) {
        self.end(false).await
    }

    async fn end(&self, force: bool) {
        let connection = {
            let mut shared = self.shared.lock().await;
            shared.state = ConnectionState::Disconnected;
            shared.discard()
        };

        match connection {
            Some(connection) => {
                info!(broker = %connection.info.broker, force, "Disconnecting from MQTT broker");
                connection.shut_down(force).await;
            }
            None => debug!("Disconnect requested without a connection"),
        }
    }

    pub async fn subscribe(&self, topic: &str, listener: ListenerHandle) -> AdapterResult<()> {
        let mut shared = self.shared.lock().await;
        let Shared {
            connection,
            registry,
            last_error,
            ..
        } = &mut *shared;

        let handle = connection.as_ref().map(|c| &*c.handle);
        if let Registration::BrokerRequestFailed(error) = registry.subscribe(handle, topic, listener)? {
            *last_error = Some(error);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str, listener: &ListenerHandle) {
        let mut shared = self.shared.lock().await;
        let Shared {
            connection,
            registry,
            last_error,
            ..
        } = &mut *shared;

        let handle = connection.as_ref().map(|c| &*c.handle);
        match registry.unsubscribe(handle, topic, listener) {
            Removal::BrokerRequestFailed(error) => *last_error = Some(error),
            Removal::NoConnection => debug!(topic, "Unsubscribe without a connection ignored"),
            Removal::NotRegistered => debug!(topic, "Unsubscribe for unregistered listener ignored"),
            Removal::Removed | Removal::BrokerUnsubscribed => {}
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> AdapterResult<()> {
        let shared = self.shared.lock().await;
        let connection = shared.connection.as_ref().ok_or(AdapterError::NotConnected)?;

        connection
            .handle
            .publish(topic, payload, options)
            .map_err(|e| AdapterError::publish(topic, e.to_string()))?;

        debug!(topic, bytes = payload.len(), qos = ?options.qos, retain = options.retain, "Published");
        Ok(())
    }

    /// Fan `payload` out to the listeners of `topic` as if it had arrived from the broker
    pub async fn dispatch(&self, topic: &str, payload: &str) -> usize {
        let dispatch = self.shared.lock().await.registry.snapshot(topic);
        dispatch.deliver(payload)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.lock().await.state.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.lock().await.state == ConnectionState::Connected
    }

    pub async fn last_error(&self) -> Option<AdapterError> {
        self.shared.lock().await.last_error.clone()
    }

    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        let shared = self.shared.lock().await;
        shared.connection.as_ref().map(|c| c.info.clone())
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.shared.lock().await.registry.topics()
    }

    pub async fn listener_count(&self, topic: &str) -> usize {
        self.shared.lock().await.registry.listener_count(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::registry::listener;
    use crate::testing::{ConnectBehavior, MockTransport};
    use crate::transport::options::DEFAULT_REQUEST_CAPACITY;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const BROKER: &str = "mqtt://mock:1883";

    fn manager(transport: &Arc<MockTransport>) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(transport.clone(), QoS::AtMostOnce))
    }

    async fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState) {
        for _ in 0..200 {
            if manager.connection_state().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Timed out waiting for state {expected:?}");
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let transport = Arc::new(MockTransport::with_behavior(ConnectBehavior::Manual));
        let manager = manager(&transport);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(BROKER, ConnectOptions::new()).await })
        };
        wait_for_state(&manager, ConnectionState::Connecting).await;

        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(BROKER, ConnectOptions::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.emit(TransportEvent::Connected));

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_error_before_first_connect_discards_connection() {
        let transport = Arc::new(MockTransport::with_behavior(ConnectBehavior::Fail(
            "connection refused".to_string(),
        )));
        let manager = manager(&transport);

        let result = manager.connect(BROKER, ConnectOptions::new()).await;

        assert!(matches!(result, Err(AdapterError::Connection { .. })));
        assert!(matches!(
            manager.connection_state().await,
            ConnectionState::ClosedWithError(_)
        ));
        assert!(manager.connection_info().await.is_none());
        assert!(matches!(
            manager.last_error().await,
            Some(AdapterError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_failure_is_returned_and_recorded() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_open("bad address");
        let manager = manager(&transport);

        let result = manager.connect("nope", ConnectOptions::new()).await;

        assert!(matches!(result, Err(AdapterError::Connection { .. })));
        assert_eq!(manager.connection_state().await, ConnectionState::Disconnected);
        assert!(manager.last_error().await.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();
        manager
            .subscribe("sensors/temp", listener(|_: &str, _: &str| {}))
            .await
            .unwrap();

        transport.emit(TransportEvent::Error("connection reset".to_string()));
        wait_for_state(
            &manager,
            ConnectionState::ClosedWithError("connection reset".to_string()),
        )
        .await;
        assert_eq!(manager.subscribed_topics().await, vec!["sensors/temp"]);

        transport.emit(TransportEvent::Connected);
        wait_for_state(&manager, ConnectionState::Connected).await;

        let handle = transport.last_handle().unwrap();
        assert_eq!(handle.subscribe_count("sensors/temp"), 2);
        assert!(manager.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_close_clears_registry() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();
        manager
            .subscribe("x", listener(|_: &str, _: &str| {}))
            .await
            .unwrap();

        transport.emit(TransportEvent::Closed);
        wait_for_state(&manager, ConnectionState::Disconnected).await;

        assert!(manager.subscribed_topics().await.is_empty());
        assert!(manager.connection_info().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_after_error_replaces_connection() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        manager
            .subscribe(
                "x",
                listener(move |_: &str, _: &str| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        transport.emit(TransportEvent::Error("broker went away".to_string()));
        wait_for_state(
            &manager,
            ConnectionState::ClosedWithError("broker went away".to_string()),
        )
        .await;

        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();

        let handles = transport.handles();
        assert_eq!(handles.len(), 2);
        assert!(handles[0].is_ended());
        assert!(manager.subscribed_topics().await.is_empty());

        // Events from the replaced connection are ignored
        handles[0].emit(TransportEvent::Message {
            topic: "x".to_string(),
            payload: "late".into(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_subscribe_ack_failure_recorded_not_fatal() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();

        transport.emit(TransportEvent::SubscribeAck {
            topic: Some("forbidden".to_string()),
            result: Err("broker rejected the subscription".to_string()),
        });

        for _ in 0..200 {
            if manager.last_error().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(
            manager.last_error().await,
            Some(AdapterError::Subscribe { ref topic, .. }) if topic == "forbidden"
        ));
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);

        manager.disconnect().await;
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.connection_state().await, ConnectionState::Disconnected);
        assert!(transport.last_handle().unwrap().is_ended());
    }

    #[tokio::test]
    async fn test_close_ends_gracefully() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();

        manager.close().await;

        let handle = transport.last_handle().unwrap();
        assert!(handle
            .calls()
            .contains(&crate::testing::HandleCall::End { force: false }));
        assert_eq!(manager.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_events_with_subscriber_installed() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        manager
            .subscribe(
                "traced",
                listener(move |_: &str, _: &str| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        transport.deliver("traced", "payload");

        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_reconnect_restores_more_topics_than_queue_holds() {
        let transport = Arc::new(MockTransport::new());
        let manager = manager(&transport);
        manager.connect(BROKER, ConnectOptions::new()).await.unwrap();

        let topics: Vec<String> = (0..DEFAULT_REQUEST_CAPACITY + 5)
            .map(|i| format!("sensors/{i}"))
            .collect();
        for topic in &topics {
            manager
                .subscribe(topic, listener(|_: &str, _: &str| {}))
                .await
                .unwrap();
        }

        let handle = transport.last_handle().unwrap();
        handle.limit_queue(DEFAULT_REQUEST_CAPACITY);

        transport.emit(TransportEvent::Error("connection reset".to_string()));
        wait_for_state(
            &manager,
            ConnectionState::ClosedWithError("connection reset".to_string()),
        )
        .await;
        transport.emit(TransportEvent::Connected);
        wait_for_state(&manager, ConnectionState::Connected).await;

        for topic in &topics {
            assert_eq!(handle.subscribe_count(topic), 2, "{topic} not restored");
        }
        assert!(manager.last_error().await.is_none());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::ClosedWithError("boom".to_string()).to_string(),
            "error: boom"
        );
    }
}
