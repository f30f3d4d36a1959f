//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for the rumqttc binding: it records every open and
//! every request, and lets a test push [`TransportEvent`]s into the adapter as if
//! they came from a broker.

use crate::transport::{
    PublishOptions, QoS, ResolvedOptions, Transport, TransportConnection, TransportError,
    TransportEvent, TransportHandle,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A request made against a [`MockHandle`]
#[derive(Debug, Clone, PartialEq)]
pub enum HandleCall {
    Subscribe(String, QoS),
    SubscribeMany(Vec<String>, QoS),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
    },
    End {
        force: bool,
    },
}

/// Recording request handle
#[derive(Debug, Default)]
pub struct MockHandle {
    calls: Mutex<Vec<HandleCall>>,
    fail_requests: AtomicBool,
    queue_limit: Mutex<Option<usize>>,
    queued: AtomicUsize,
    ended: AtomicBool,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl MockHandle {
    /// A handle with no event stream attached
    pub fn new() -> Self {
        Self::default()
    }

    fn with_events(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    /// Make subscribe/unsubscribe/publish requests fail
    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Accept only `capacity` more requests, like a bounded queue that never drains
    pub fn limit_queue(&self, capacity: usize) {
        self.queued.store(0, Ordering::SeqCst);
        *lock(&self.queue_limit) = Some(capacity);
    }

    pub fn calls(&self) -> Vec<HandleCall> {
        lock(&self.calls).clone()
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| match call {
                HandleCall::Subscribe(t, _) => t == topic,
                HandleCall::SubscribeMany(topics, _) => topics.iter().any(|t| t == topic),
                _ => false,
            })
            .count()
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, HandleCall::Unsubscribe(t) if t == topic))
            .count()
    }

    /// `(topic, payload)` of every publish, in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HandleCall::Publish { topic, payload, .. } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Push an event as if the broker produced it; false if nobody is listening
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    fn check_request(&self) -> Result<(), TransportError> {
        if self.is_ended() {
            return Err(TransportError::RequestRejected(
                "connection already ended".into(),
            ));
        }
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(TransportError::RequestRejected(
                "mock request failure".into(),
            ));
        }
        if let Some(capacity) = *lock(&self.queue_limit) {
            if self.queued.fetch_add(1, Ordering::SeqCst) >= capacity {
                return Err(TransportError::RequestRejected("request queue full".into()));
            }
        }
        Ok(())
    }

    fn record(&self, call: HandleCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(HandleCall::Subscribe(topic.to_string(), qos));
        self.check_request()
    }

    fn subscribe_many(&self, topics: &[String], qos: QoS) -> Result<(), TransportError> {
        self.record(HandleCall::SubscribeMany(topics.to_vec(), qos));
        self.check_request()
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(HandleCall::Unsubscribe(topic.to_string()));
        self.check_request()
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.record(HandleCall::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            options,
        });
        self.check_request()
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        self.record(HandleCall::End { force });
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::Closed);
        }
        Ok(())
    }
}

/// How a freshly opened mock connection behaves
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    /// Emit `Connected` immediately
    AutoConnect,
    /// Emit `Error` with this message immediately
    Fail(String),
    /// Emit nothing; the test drives events with [`MockTransport::emit`]
    Manual,
}

/// One call to [`Transport::open`]
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub address: String,
    pub options: ResolvedOptions,
}

/// Mock transport for testing
pub struct MockTransport {
    behavior: Mutex<ConnectBehavior>,
    open_error: Mutex<Option<String>>,
    opens: Mutex<Vec<OpenRecord>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::with_behavior(ConnectBehavior::AutoConnect)
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            open_error: Mutex::new(None),
            opens: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Behaviour for connections opened from now on
    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Make `open` itself fail, as the real binding does for a bad address
    pub fn fail_open(&self, message: impl Into<String>) {
        *lock(&self.open_error) = Some(message.into());
    }

    pub fn open_count(&self) -> usize {
        lock(&self.opens).len()
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        lock(&self.opens).clone()
    }

    /// Handle of the most recently opened connection
    pub fn last_handle(&self) -> Option<Arc<MockHandle>> {
        lock(&self.handles).last().cloned()
    }

    /// Every handle opened so far, oldest first
    pub fn handles(&self) -> Vec<Arc<MockHandle>> {
        lock(&self.handles).clone()
    }

    /// Push an event on the most recent connection
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.last_handle().is_some_and(|handle| handle.emit(event))
    }

    /// Shorthand for an inbound publish on the most recent connection
    pub fn deliver(&self, topic: &str, payload: &str) -> bool {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: bytes::Bytes::copy_from_slice(payload.as_bytes()),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        address: &str,
        options: &ResolvedOptions,
    ) -> Result<TransportConnection, TransportError> {
        lock(&self.opens).push(OpenRecord {
            address: address.to_string(),
            options: options.clone(),
        });

        if let Some(message) = lock(&self.open_error).clone() {
            return Err(TransportError::ConnectionFailed(message));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(MockHandle::with_events(events_tx));

        match lock(&self.behavior).clone() {
            ConnectBehavior::AutoConnect => {
                handle.emit(TransportEvent::Connected);
            }
            ConnectBehavior::Fail(message) => {
                handle.emit(TransportEvent::Error(message));
            }
            ConnectBehavior::Manual => {}
        }

        lock(&self.handles).push(handle.clone());

        Ok(TransportConnection {
            handle,
            events: events_rx,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
