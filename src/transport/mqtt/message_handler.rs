//! Pure routing of rumqttc events
//!
//! The event pump in [`super::client`] feeds every polled event through
//! [`MessageHandler::route_mqtt_event`] and acts on the resulting [`EventRoute`].

use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Pure message routing decisions based on rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a rumqttc event to the action the pump should take
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                // rumqttc turns a refused ConnAck into a `poll` error, so only
                // accepted connections reach here
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    granted: Self::granted_filters(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => {
                EventRoute::SubscribeSent(*packet_id)
            }
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Per-filter outcome of a SubAck, in request order
    pub fn granted_filters(return_codes: &[SubscribeReasonCode]) -> Vec<bool> {
        return_codes
            .iter()
            .map(|code| matches!(code, SubscribeReasonCode::Success(_)))
            .collect()
    }
}

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    MessageReceived { topic: String, payload: Bytes },
    /// SUBSCRIBE packet left the client with this packet id
    SubscribeSent(u16),
    /// One flag per filter of the original request
    SubscriptionAcknowledged { packet_id: u16, granted: Vec<bool> },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Our own DISCONNECT left the client (graceful close)
    DisconnectSent,
    /// Infrastructure event (PingResp, UnsubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Correlates SubAcks with the topics that were requested
///
/// rumqttc assigns packet ids when the request leaves the queue, so requests are
/// queued in order and bound to an id on `Outgoing::Subscribe`. One request may
/// carry several topics.
#[derive(Debug, Default)]
pub struct SubscribeTracker {
    queued: VecDeque<Vec<String>>,
    in_flight: HashMap<u16, Vec<String>>,
}

impl SubscribeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscribe request that was handed to the client
    pub fn queue(&mut self, topics: Vec<String>) {
        self.queued.push_back(topics);
    }

    /// Drop the most recent queued request (the client refused it)
    pub fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    pub fn sent(&mut self, packet_id: u16) {
        if let Some(topics) = self.queued.pop_front() {
            self.in_flight.insert(packet_id, topics);
        } else {
            debug!(packet_id, "SUBSCRIBE sent with no queued topic");
        }
    }

    /// Topics of the acknowledged request; empty when the id is unknown
    pub fn acknowledged(&mut self, packet_id: u16) -> Vec<String> {
        self.in_flight.remove(&packet_id).unwrap_or_default()
    }

    /// Forget everything; used when the session is torn down
    pub fn reset(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}
