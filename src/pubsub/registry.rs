//! Topic subscription registry
//!
//! Maps an exact topic string to the set of listeners interested in it. Broker
//! subscriptions are reference counted by set size: the broker is asked to
//! subscribe when a topic gains its first listener and to unsubscribe when it
//! loses its last one. A topic key exists if and only if its set is non-empty.
//!
//! The registry does no locking of its own; the connection manager keeps it
//! behind the same mutex as the connection handle.

use crate::error::AdapterError;
use crate::transport::{QoS, TransportHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives messages for the topics it is registered on
pub trait MessageListener: Send + Sync {
    fn on_message(&self, payload: &str, topic: &str);
}

impl<F> MessageListener for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn on_message(&self, payload: &str, topic: &str) {
        self(payload, topic)
    }
}

/// Shared listener; identity is the allocation, not the value
pub type ListenerHandle = Arc<dyn MessageListener>;

/// Wrap a closure as a [`ListenerHandle`]
pub fn listener<F>(callback: F) -> ListenerHandle
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    Arc::new(callback)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerKey(usize);

impl ListenerKey {
    fn of(listener: &ListenerHandle) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }
}

/// What `subscribe` did
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// First listener; broker subscribe request queued
    BrokerSubscribed,
    /// First listener; the broker request failed but the listener is registered
    BrokerRequestFailed(AdapterError),
    /// Topic already had listeners; no broker traffic
    Added,
    /// This exact listener was already registered
    AlreadyRegistered,
}

/// What `unsubscribe` did
#[derive(Debug, Clone, PartialEq)]
pub enum Removal {
    /// No connection; nothing touched
    NoConnection,
    /// Topic unknown or listener not registered on it
    NotRegistered,
    /// Listener removed, others remain
    Removed,
    /// Last listener removed; broker unsubscribe request queued
    BrokerUnsubscribed,
    /// Last listener removed; the broker request failed
    BrokerRequestFailed(AdapterError),
}

/// Listeners captured for one inbound message
///
/// Taken under the adapter lock and delivered after it is released, so a
/// listener may call back into the adapter.
pub struct Dispatch {
    topic: String,
    listeners: Vec<ListenerHandle>,
}

impl Dispatch {
    /// Invoke every captured listener with `(payload, topic)`; returns how many ran
    pub fn deliver(&self, payload: &str) -> usize {
        for listener in &self.listeners {
            listener.on_message(payload, &self.topic);
        }
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// Topic -> listener set, with reference-counted broker subscriptions
pub struct SubscriptionRegistry {
    topics: HashMap<String, HashMap<ListenerKey, ListenerHandle>>,
    qos: QoS,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(QoS::AtMostOnce)
    }
}

impl SubscriptionRegistry {
    /// `qos` is used for every broker subscribe request
    pub fn new(qos: QoS) -> Self {
        Self {
            topics: HashMap::new(),
            qos,
        }
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Register `listener` for `topic`, subscribing at the broker on the first one.
    ///
    /// Fails with `NotConnected` when `connection` is `None`. A failed broker
    /// request is logged and reported in the returned [`Registration`], but the
    /// listener stays registered.
    pub fn subscribe(
        &mut self,
        connection: Option<&dyn TransportHandle>,
        topic: &str,
        listener: ListenerHandle,
    ) -> Result<Registration, AdapterError> {
        let connection = connection.ok_or(AdapterError::NotConnected)?;
        let key = ListenerKey::of(&listener);

        if let Some(listeners) = self.topics.get_mut(topic) {
            if listeners.contains_key(&key) {
                debug!(topic, "Listener already registered");
                return Ok(Registration::AlreadyRegistered);
            }
            listeners.insert(key, listener);
            debug!(topic, listeners = listeners.len(), "Listener added");
            return Ok(Registration::Added);
        }

        let registration = match connection.subscribe(topic, self.qos) {
            Ok(()) => {
                info!(topic, qos = ?self.qos, "Subscribed");
                Registration::BrokerSubscribed
            }
            Err(e) => {
                let error = AdapterError::subscribe(topic, e.to_string());
                warn!(topic, "Broker subscribe request failed: {}", error);
                Registration::BrokerRequestFailed(error)
            }
        };

        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(key, listener);

        Ok(registration)
    }

    /// Remove `listener` from `topic`, unsubscribing at the broker when it was the last.
    pub fn unsubscribe(
        &mut self,
        connection: Option<&dyn TransportHandle>,
        topic: &str,
        listener: &ListenerHandle,
    ) -> Removal {
        let Some(connection) = connection else {
            return Removal::NoConnection;
        };

        let key = ListenerKey::of(listener);
        let Some(listeners) = self.topics.get_mut(topic) else {
            return Removal::NotRegistered;
        };
        if listeners.remove(&key).is_none() {
            return Removal::NotRegistered;
        }
        if !listeners.is_empty() {
            debug!(topic, listeners = listeners.len(), "Listener removed");
            return Removal::Removed;
        }

        self.topics.remove(topic);
        match connection.unsubscribe(topic) {
            Ok(()) => {
                info!(topic, "Unsubscribed");
                Removal::BrokerUnsubscribed
            }
            Err(e) => {
                let error = AdapterError::subscribe(topic, e.to_string());
                warn!(topic, "Broker unsubscribe request failed: {}", error);
                Removal::BrokerRequestFailed(error)
            }
        }
    }

    /// Capture the listeners registered for exactly `topic`
    pub fn snapshot(&self, topic: &str) -> Dispatch {
        let listeners = self
            .topics
            .get(topic)
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default();

        Dispatch {
            topic: topic.to_string(),
            listeners,
        }
    }

    /// Deliver `payload` to every listener of `topic`; unknown topics are dropped
    pub fn dispatch(&self, topic: &str, payload: &str) -> usize {
        let delivered = self.snapshot(topic).deliver(payload);
        if delivered == 0 {
            debug!(topic, "No listeners for inbound message, dropped");
        }
        delivered
    }

    /// Re-issue broker subscriptions for every topic, e.g. after a reconnect with
    /// a clean session. All topics go out in one request so a burst can't
    /// overflow the transport's request queue.
    pub fn resubscribe_all(&self, connection: &dyn TransportHandle) -> Option<AdapterError> {
        if self.topics.is_empty() {
            return None;
        }

        let topics = self.topics();
        match connection.subscribe_many(&topics, self.qos) {
            Ok(()) => {
                debug!(topics = topics.len(), "Re-subscribed");
                None
            }
            Err(e) => {
                let error = AdapterError::subscribe(topics.join(", "), e.to_string());
                warn!(topics = topics.len(), "Re-subscribe failed: {}", error);
                Some(error)
            }
        }
    }

    /// Drop every entry without broker traffic; the broker session is already gone
    pub fn clear(&mut self) {
        if !self.topics.is_empty() {
            debug!(topics = self.topics.len(), "Clearing subscription registry");
        }
        self.topics.clear();
    }

    /// Subscribed topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashMap::len)
    }

    pub fn contains(&self, topic: &str, listener: &ListenerHandle) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|listeners| listeners.contains_key(&ListenerKey::of(listener)))
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Number of topics
    pub fn len(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HandleCall, MockHandle};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn recording_listener() -> (ListenerHandle, Arc<Mutex<Vec<(String, String)>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handle = listener(move |payload: &str, topic: &str| {
            sink.lock()
                .unwrap()
                .push((payload.to_string(), topic.to_string()));
        });
        (handle, received)
    }

    #[test]
    fn test_subscribe_requires_connection() {
        let mut registry = SubscriptionRegistry::default();
        let (l1, _) = recording_listener();

        let result = registry.subscribe(None, "a/b", l1);
        assert_eq!(result, Err(AdapterError::NotConnected));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broker_subscribe_only_on_first_listener() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let (l1, _) = recording_listener();
        let (l2, _) = recording_listener();

        assert_eq!(
            registry.subscribe(Some(&handle), "x", l1.clone()),
            Ok(Registration::BrokerSubscribed)
        );
        assert_eq!(
            registry.subscribe(Some(&handle), "x", l2),
            Ok(Registration::Added)
        );
        assert_eq!(
            registry.subscribe(Some(&handle), "x", l1),
            Ok(Registration::AlreadyRegistered)
        );

        assert_eq!(handle.subscribe_count("x"), 1);
        assert_eq!(registry.listener_count("x"), 2);
    }

    #[test]
    fn test_broker_failure_keeps_local_registration() {
        let handle = MockHandle::new();
        handle.fail_requests(true);
        let mut registry = SubscriptionRegistry::default();
        let (l1, received) = recording_listener();

        let registration = registry.subscribe(Some(&handle), "x", l1.clone()).unwrap();
        assert!(matches!(
            registration,
            Registration::BrokerRequestFailed(AdapterError::Subscribe { .. })
        ));
        assert!(registry.contains("x", &l1));

        registry.dispatch("x", "still delivered");
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_last_listener_removes_topic() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let (l1, _) = recording_listener();
        let (l2, _) = recording_listener();

        registry.subscribe(Some(&handle), "x", l1.clone()).unwrap();
        registry.subscribe(Some(&handle), "x", l2.clone()).unwrap();

        assert_eq!(registry.unsubscribe(Some(&handle), "x", &l1), Removal::Removed);
        assert_eq!(handle.unsubscribe_count("x"), 0);

        assert_eq!(
            registry.unsubscribe(Some(&handle), "x", &l2),
            Removal::BrokerUnsubscribed
        );
        assert_eq!(handle.unsubscribe_count("x"), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_listener_is_noop() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let (l1, _) = recording_listener();
        let (stranger, _) = recording_listener();

        assert_eq!(
            registry.unsubscribe(Some(&handle), "never", &l1),
            Removal::NotRegistered
        );

        registry.subscribe(Some(&handle), "x", l1.clone()).unwrap();
        assert_eq!(
            registry.unsubscribe(Some(&handle), "x", &stranger),
            Removal::NotRegistered
        );
        assert_eq!(registry.listener_count("x"), 1);
        assert_eq!(registry.unsubscribe(None, "x", &l1), Removal::NoConnection);
        assert!(registry.contains("x", &l1));
        assert!(handle.calls().iter().all(|c| !matches!(c, HandleCall::Unsubscribe(_))));
    }

    #[test]
    fn test_dispatch_exact_match_only() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let (l1, received) = recording_listener();

        registry.subscribe(Some(&handle), "a/+", l1).unwrap();

        assert_eq!(registry.dispatch("a/b", "no wildcard expansion"), 0);
        assert_eq!(registry.dispatch("a/+", "literal"), 1);
        assert_eq!(
            *received.lock().unwrap(),
            vec![("literal".to_string(), "a/+".to_string())]
        );
    }

    #[test]
    fn test_dispatch_to_all_listeners() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let (l1, r1) = recording_listener();
        let (l2, r2) = recording_listener();

        registry.subscribe(Some(&handle), "x", l1).unwrap();
        registry.subscribe(Some(&handle), "x", l2).unwrap();

        assert_eq!(registry.dispatch("x", "hi"), 2);
        assert_eq!(r1.lock().unwrap().len(), 1);
        assert_eq!(r2.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_same_closure_body_distinct_identity() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let a = listener(|_: &str, _: &str| {});
        let b = listener(|_: &str, _: &str| {});

        registry.subscribe(Some(&handle), "x", a.clone()).unwrap();
        registry.subscribe(Some(&handle), "x", b).unwrap();
        assert_eq!(registry.listener_count("x"), 2);
        assert!(registry.contains("x", &a));
    }

    #[test]
    fn test_clear_makes_no_broker_calls() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let (l1, _) = recording_listener();
        registry.subscribe(Some(&handle), "x", l1.clone()).unwrap();
        registry.subscribe(Some(&handle), "y", l1).unwrap();

        registry.clear();

        assert!(registry.is_empty());
        assert_eq!(handle.unsubscribe_count("x"), 0);
        assert_eq!(handle.unsubscribe_count("y"), 0);
    }

    #[test]
    fn test_resubscribe_all_and_topics() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::new(QoS::AtLeastOnce);
        let (l1, _) = recording_listener();
        registry.subscribe(Some(&handle), "b", l1.clone()).unwrap();
        registry.subscribe(Some(&handle), "a", l1).unwrap();

        assert!(registry.resubscribe_all(&handle).is_none());
        assert_eq!(handle.subscribe_count("a"), 2);
        assert_eq!(handle.subscribe_count("b"), 2);
        assert_eq!(registry.topics(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            handle.calls().last(),
            Some(&HandleCall::SubscribeMany(
                vec!["a".to_string(), "b".to_string()],
                QoS::AtLeastOnce
            ))
        );
    }

    #[test]
    fn test_resubscribe_all_uses_one_request_for_many_topics() {
        let handle = MockHandle::new();
        let mut registry = SubscriptionRegistry::default();
        let (l1, _) = recording_listener();
        for i in 0..15 {
            registry
                .subscribe(Some(&handle), &format!("bulk/{i}"), l1.clone())
                .unwrap();
        }

        // Room for a single queued request, as with a busy rumqttc client
        handle.limit_queue(1);
        assert!(registry.resubscribe_all(&handle).is_none());
        for i in 0..15 {
            assert_eq!(handle.subscribe_count(&format!("bulk/{i}")), 2);
        }

        assert!(matches!(
            registry.resubscribe_all(&handle),
            Some(AdapterError::Subscribe { .. })
        ));
    }

    #[test]
    fn test_resubscribe_all_empty_registry_is_silent() {
        let handle = MockHandle::new();
        let registry = SubscriptionRegistry::default();

        assert!(registry.resubscribe_all(&handle).is_none());
        assert!(handle.calls().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(usize, usize),
        Unsubscribe(usize, usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 0..4usize).prop_map(|(t, l)| Op::Subscribe(t, l)),
            (0..3usize, 0..4usize).prop_map(|(t, l)| Op::Unsubscribe(t, l)),
        ]
    }

    proptest! {
        #[test]
        fn broker_subscription_follows_set_emptiness(ops in proptest::collection::vec(op_strategy(), 0..60)) {
            let handle = MockHandle::new();
            let mut registry = SubscriptionRegistry::default();
            let topics = ["a", "b/c", "d/+"];
            let listeners: Vec<ListenerHandle> =
                (0..4).map(|_| listener(|_: &str, _: &str| {})).collect();
            let mut model: Vec<HashSet<usize>> = vec![HashSet::new(); topics.len()];

            for op in ops {
                match op {
                    Op::Subscribe(t, l) => {
                        registry
                            .subscribe(Some(&handle), topics[t], listeners[l].clone())
                            .unwrap();
                        model[t].insert(l);
                    }
                    Op::Unsubscribe(t, l) => {
                        registry.unsubscribe(Some(&handle), topics[t], &listeners[l]);
                        model[t].remove(&l);
                    }
                }

                for (t, topic) in topics.iter().enumerate() {
                    prop_assert_eq!(registry.listener_count(topic), model[t].len());
                    // One outstanding broker subscription per non-empty set
                    let outstanding =
                        handle.subscribe_count(topic) as i64 - handle.unsubscribe_count(topic) as i64;
                    prop_assert_eq!(outstanding, i64::from(!model[t].is_empty()));
                }
            }
        }

        #[test]
        fn dispatch_to_unknown_topic_has_no_effect(topic in "[a-z/]{1,12}", payload in ".*") {
            prop_assume!(topic != "sentinel");
            let handle = MockHandle::new();
            let mut registry = SubscriptionRegistry::default();
            let (l1, received) = recording_listener();
            registry.subscribe(Some(&handle), "sentinel", l1).unwrap();

            prop_assert_eq!(registry.dispatch(&topic, &payload), 0);
            prop_assert!(received.lock().unwrap().is_empty());
            prop_assert_eq!(handle.calls().len(), 1);
        }
    }
}
