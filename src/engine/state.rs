//! Pure connection state machine for the MQTT engine
//!
//! This module contains the pure pieces of the engine: the connection state
//! enum, the transition function driven by connection events, the retry
//! policy, and the routing of broker events. All of it is testable without
//! a scheduler or a broker.

use std::time::Duration;

use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// Connection state of the engine, readable from any task through the
/// engine's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No broker connection and no attempt in flight.
    Disconnected,
    /// Opening the TCP socket to the broker.
    ConnectingSocket,
    /// Socket up, MQTT CONNECT sent, waiting for ConnAck.
    ConnectingProtocol,
    /// Session acknowledged, SUBSCRIBE sent, waiting for SubAck.
    Subscribing,
    /// Fully connected and serving the mailbox.
    Connected,
}

/// Events that drive [`next_state`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new connection attempt has begun.
    AttemptStarted,
    /// The transport produced its first event; the socket is up.
    SocketConnected,
    /// ConnAck received from the broker.
    ConnAck,
    /// SubAck received for the configured subscription.
    SubAck,
    /// The connection failed or the broker disconnected us.
    ConnectionLost(String),
    /// Cooperative stop requested.
    StopRequested,
}

/// Compute the next connection state (pure function).
///
/// Transitions are monotonic within one attempt: stale events never move
/// the state backwards, only `ConnectionLost`/`StopRequested` reset it.
pub fn next_state(current: EngineState, event: &EngineEvent) -> EngineState {
    use EngineState::*;
    match (current, event) {
        (_, EngineEvent::StopRequested) => Disconnected,
        (_, EngineEvent::ConnectionLost(_)) => Disconnected,
        (Disconnected, EngineEvent::AttemptStarted) => ConnectingSocket,
        (ConnectingSocket, EngineEvent::SocketConnected) => ConnectingProtocol,
        (ConnectingSocket | ConnectingProtocol, EngineEvent::ConnAck) => Subscribing,
        (Subscribing, EngineEvent::SubAck) => Connected,
        (state, _) => state,
    }
}

/// Whether the given state allows accepting publish requests (pure function).
pub fn can_publish(state: EngineState) -> bool {
    matches!(state, EngineState::Connected)
}

/// Backoff policy for the engine's retry loop.
///
/// Connection-phase failures (socket, CONNECT, SUBSCRIBE) retry on the short
/// delay; a failure after reaching [`EngineState::Connected`] backs off
/// longer before restarting the whole sequence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay between failed connection attempts.
    pub connect_retry: Duration,
    /// Delay before reconnecting after losing an established session.
    pub reconnect_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Pick the delay to apply after a failure in the given state (pure function).
    pub fn delay_after_failure(&self, state: EngineState) -> Duration {
        if state == EngineState::Connected {
            self.reconnect_delay
        } else {
            self.connect_retry
        }
    }
}

/// Routing decision for one broker event.
#[derive(Debug)]
pub enum BrokerEventRoute {
    /// ConnAck received; subscribe and wait for confirmation.
    ConnectionAcknowledged,
    /// SubAck received; the session is fully up.
    SubscriptionConfirmed,
    /// Inbound message on a subscribed topic.
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Broker closed the session.
    Disconnected,
    /// Keep-alive and other infrastructure traffic; nothing to do.
    Infrastructure,
}

/// Route one rumqttc event to an engine action (pure routing decision).
pub fn route_broker_event(event: &Event) -> BrokerEventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => BrokerEventRoute::ConnectionAcknowledged,
            Packet::SubAck(_) => BrokerEventRoute::SubscriptionConfirmed,
            Packet::Publish(publish) => BrokerEventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
            },
            Packet::Disconnect(_) => BrokerEventRoute::Disconnected,
            _ => BrokerEventRoute::Infrastructure,
        },
        Event::Outgoing(_) => BrokerEventRoute::Infrastructure,
    }
}
