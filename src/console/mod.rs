//! Console session
//!
//! A thin consumer of [`PubSubAdapter`] that keeps what an interactive client
//! needs to show: a bounded, newest-first history of received messages, the
//! topics it is subscribed to, and the last error. It holds no MQTT logic.

use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::error::AdapterError;
use crate::pubsub::{listener, ConnectionInfo, ConnectionState, ListenerHandle, PubSubAdapter};
use crate::transport::{ConnectOptions, PublishOptions};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A message as received, with its arrival time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Bounded message history, newest first
#[derive(Debug, Clone)]
pub struct MessageLog {
    records: VecDeque<InboundMessage>,
    capacity: usize,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_LIMIT)
    }
}

impl MessageLog {
    /// A capacity of zero is treated as one
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend `message`, dropping the oldest record when full
    pub fn push(&mut self, message: InboundMessage) {
        self.records.push_front(message);
        self.records.truncate(self.capacity);
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.records.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Ten random alphanumeric characters, handy as a test payload
pub fn random_message() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

#[derive(Default)]
struct SessionState {
    log: MessageLog,
    topics: Vec<String>,
    last_error: Option<AdapterError>,
    feed: Option<mpsc::UnboundedSender<InboundMessage>>,
}

impl SessionState {
    fn record(&mut self, message: InboundMessage) {
        if let Some(feed) = &self.feed {
            if feed.send(message.clone()).is_err() {
                debug!("Message feed receiver dropped");
                self.feed = None;
            }
        }
        self.log.push(message);
    }
}

/// Interactive session over a shared adapter
pub struct ConsoleSession {
    adapter: Arc<PubSubAdapter>,
    state: Arc<Mutex<SessionState>>,
    listener: ListenerHandle,
    default_topic: Option<String>,
    publish_options: PublishOptions,
}

impl ConsoleSession {
    pub fn new(adapter: Arc<PubSubAdapter>) -> Self {
        let state = Arc::new(Mutex::new(SessionState::default()));
        let sink = state.clone();
        let listener = listener(move |payload: &str, topic: &str| {
            lock(&sink).record(InboundMessage::new(topic, payload));
        });

        Self {
            adapter,
            state,
            listener,
            default_topic: None,
            publish_options: PublishOptions::default(),
        }
    }

    /// Keep at most `limit` received messages
    pub fn with_history_limit(self, limit: usize) -> Self {
        lock(&self.state).log = MessageLog::with_capacity(limit);
        self
    }

    /// Also send every received message to `feed`
    pub fn with_feed(self, feed: mpsc::UnboundedSender<InboundMessage>) -> Self {
        lock(&self.state).feed = Some(feed);
        self
    }

    pub fn with_publish_options(mut self, options: PublishOptions) -> Self {
        self.publish_options = options;
        self
    }

    /// Connect and subscribe the default topic.
    ///
    /// Failures are recorded as the last error rather than returned; the
    /// result says whether the session ended up connected.
    pub async fn open(
        &mut self,
        broker: &str,
        default_topic: Option<&str>,
        options: ConnectOptions,
    ) -> bool {
        self.default_topic = default_topic
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_string);

        match self.adapter.connect(broker, options).await {
            Ok(info) => {
                debug!(client_id = %info.client_id, "Console session connected");
                self.set_error(None);
                // A replaced or closed connection took its subscriptions with it
                let live = self.adapter.subscribed_topics().await;
                lock(&self.state).topics.retain(|topic| live.contains(topic));
            }
            Err(e) => {
                warn!("Console session failed to connect: {}", e);
                self.set_error(Some(e));
                return false;
            }
        }

        if let Some(topic) = self.default_topic.clone() {
            self.subscribe(&topic).await;
        }
        true
    }

    /// Subscribe to `topic`; already-subscribed topics are left alone
    pub async fn subscribe(&self, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() {
            return false;
        }
        if !self.adapter.is_connected().await {
            self.set_error(Some(AdapterError::NotConnected));
            return false;
        }

        // The registry ignores a listener it already holds, so repeats are no-ops
        match self.adapter.subscribe(topic, self.listener.clone()).await {
            Ok(()) => {
                let mut state = lock(&self.state);
                if !state.topics.iter().any(|t| t == topic) {
                    state.topics.push(topic.to_string());
                }
                true
            }
            Err(e) => {
                self.set_error(Some(e));
                false
            }
        }
    }

    pub async fn unsubscribe(&self, topic: &str) {
        let topic = topic.trim();
        self.adapter.unsubscribe(topic, &self.listener).await;
        lock(&self.state).topics.retain(|t| t != topic);
    }

    /// Publish `text`; a blank topic means the default topic. Returns success.
    pub async fn publish(&self, topic: &str, text: &str) -> bool {
        let topic = match (topic.trim(), &self.default_topic) {
            ("", Some(default)) => default.clone(),
            ("", None) => {
                self.set_error(Some(AdapterError::publish("", "no topic given")));
                return false;
            }
            (topic, _) => topic.to_string(),
        };

        if !self.adapter.is_connected().await {
            self.set_error(Some(AdapterError::NotConnected));
            return false;
        }

        match self
            .adapter
            .publish_with(&topic, text, self.publish_options)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.set_error(Some(e));
                false
            }
        }
    }

    pub fn clear_messages(&self) {
        lock(&self.state).log.clear();
    }

    /// Received messages, newest first
    pub fn messages(&self) -> Vec<InboundMessage> {
        lock(&self.state).log.messages()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        lock(&self.state).topics.clone()
    }

    pub fn default_topic(&self) -> Option<&str> {
        self.default_topic.as_deref()
    }

    /// The session's own last error, else the adapter's
    pub async fn last_error(&self) -> Option<AdapterError> {
        let own = lock(&self.state).last_error.clone();
        match own {
            Some(error) => Some(error),
            None => self.adapter.last_error().await,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.adapter.connection_state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.adapter.is_connected().await
    }

    /// `None` once the connection is gone for good
    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.adapter.connection_info().await
    }

    /// Drop this session's subscriptions and disconnect the adapter
    pub async fn close(&self) {
        for topic in self.subscribed_topics() {
            self.adapter.unsubscribe(&topic, &self.listener).await;
        }
        lock(&self.state).topics.clear();
        self.adapter.disconnect().await;
    }

    fn set_error(&self, error: Option<AdapterError>) {
        lock(&self.state).last_error = error;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
