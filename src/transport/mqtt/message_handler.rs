//! Pure routing of `rumqttc` events and acknowledgement tracking
//!
//! Nothing here performs I/O. [`MessageHandler`] decides what an event loop event
//! means, and [`AckTracker`] correlates packet ids with the callers waiting on them.

use crate::error::LinkError;
use crate::transport::LinkEvent;
use bytes::Bytes;
use rumqttc::{
    ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, QoS, StateError,
    SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event loop event to the action the driver should take
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(refusal_message(code)),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::PubAck(ack) => EventRoute::Acknowledged {
                    kind: AckKind::Publish,
                    pkid: ack.pkid,
                    success: true,
                },
                Packet::PubComp(comp) => EventRoute::Acknowledged {
                    kind: AckKind::Publish,
                    pkid: comp.pkid,
                    success: true,
                },
                Packet::SubAck(suback) => EventRoute::Acknowledged {
                    kind: AckKind::Subscribe,
                    pkid: suback.pkid,
                    success: Self::subscription_succeeded(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => EventRoute::Acknowledged {
                    kind: AckKind::Unsubscribe,
                    pkid: unsuback.pkid,
                    success: true,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::Sent {
                    kind: AckKind::Publish,
                    pkid: *pkid,
                },
                Outgoing::Subscribe(pkid) => EventRoute::Sent {
                    kind: AckKind::Subscribe,
                    pkid: *pkid,
                },
                Outgoing::Unsubscribe(pkid) => EventRoute::Sent {
                    kind: AckKind::Unsubscribe,
                    pkid: *pkid,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// A SUBACK succeeds only if no topic filter was refused
    pub fn subscription_succeeded(return_codes: &[SubscribeReasonCode]) -> bool {
        !return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
    }

    /// Describe an event loop failure the way the error classifier expects
    pub fn link_error_from_connection(error: &ConnectionError) -> LinkError {
        match error {
            ConnectionError::ConnectionRefused(code) => LinkError::new(refusal_message(*code)),
            ConnectionError::Io(io) | ConnectionError::MqttState(StateError::Io(io)) => {
                LinkError::socket(format!("{:?}", io.kind()), io.to_string())
            }
            ConnectionError::NetworkTimeout => {
                LinkError::socket("TimedOut", "network timeout while connecting")
            }
            other => LinkError::new(other.to_string()),
        }
    }

    /// Event raised when the event loop stops with an error
    pub fn loop_error_event(error: &ConnectionError) -> LinkEvent {
        let closed_by_peer = match error {
            ConnectionError::Io(io) | ConnectionError::MqttState(StateError::Io(io)) => matches!(
                io.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof
            ),
            _ => false,
        };

        if closed_by_peer {
            LinkEvent::Closed
        } else {
            LinkEvent::Error(Self::link_error_from_connection(error))
        }
    }
}

fn refusal_message(code: ConnectReturnCode) -> String {
    let reason = match code {
        ConnectReturnCode::Success => "Success",
        ConnectReturnCode::RefusedProtocolVersion => "Unacceptable protocol version",
        ConnectReturnCode::BadClientId => "Identifier rejected",
        ConnectReturnCode::ServiceUnavailable => "Server unavailable",
        ConnectReturnCode::BadUserNamePassword => "Bad username or password",
        ConnectReturnCode::NotAuthorized => "Not authorized",
    };
    format!("Connection refused: {reason}")
}

/// Packet families that receive an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK with a success code
    ConnectionAcknowledged,
    /// CONNACK with a refusal code
    ConnectionRefused(String),
    /// Application message on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// PUBACK / PUBCOMP / SUBACK / UNSUBACK
    Acknowledged {
        kind: AckKind,
        pkid: u16,
        success: bool,
    },
    /// A request left the client with the given packet id
    Sent { kind: AckKind, pkid: u16 },
    /// Our DISCONNECT packet was written
    DisconnectSent,
    /// The broker sent DISCONNECT
    Disconnected,
    /// Pings and other bookkeeping packets
    InfrastructureEvent(String),
    /// Outgoing packets nobody waits for
    OutgoingEvent,
}

/// Correlates requests with their acknowledgements.
///
/// Requests are registered in the order they are handed to the client. The client
/// emits an outgoing event carrying the packet id for each of them in that same
/// order, which moves the waiter from the FIFO queue into the in-flight map until
/// the matching acknowledgement arrives. QoS 0 publishes complete as soon as they
/// are written.
#[derive(Debug)]
pub struct AckTracker<W> {
    queued: VecDeque<(AckKind, QoS, W)>,
    in_flight: HashMap<(AckKind, u16), W>,
}

impl<W> Default for AckTracker<W> {
    fn default() -> Self {
        Self {
            queued: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }
}

impl<W> AckTracker<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next request of `kind`
    pub fn expect(&mut self, kind: AckKind, qos: QoS, waiter: W) {
        self.queued.push_back((kind, qos, waiter));
    }

    /// Take back the most recent registration when the request never reached the client
    pub fn cancel_last(&mut self) -> Option<W> {
        self.queued.pop_back().map(|(_, _, waiter)| waiter)
    }

    /// Record that a request was written. Returns the waiter if it is already complete.
    pub fn on_sent(&mut self, kind: AckKind, pkid: u16) -> Option<W> {
        let position = self.queued.iter().position(|(k, _, _)| *k == kind)?;
        let (_, qos, waiter) = self.queued.remove(position)?;

        if kind == AckKind::Publish && qos == QoS::AtMostOnce {
            return Some(waiter);
        }
        self.in_flight.insert((kind, pkid), waiter);
        None
    }

    /// Take the waiter for an acknowledgement, if anybody is waiting
    pub fn on_ack(&mut self, kind: AckKind, pkid: u16) -> Option<W> {
        self.in_flight.remove(&(kind, pkid))
    }

    /// Number of requests not yet acknowledged
    pub fn len(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every waiter, for when the connection is gone
    pub fn drain(&mut self) -> Vec<W> {
        let mut waiters: Vec<W> = self.queued.drain(..).map(|(_, _, w)| w).collect();
        waiters.extend(self.in_flight.drain().map(|(_, w)| w));
        waiters
    }
}
