//! Transport layer abstraction
//!
//! The connection manager never talks to a concrete MQTT library. It is handed an
//! [`MqttConnector`] at construction time, which opens [`MqttLink`]s. The production
//! implementation wraps `rumqttc` ([`mqtt::RumqttcConnector`]); tests use the fake
//! broker in [`crate::testing`].

use crate::error::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::ConnectionConfig;

/// Unsolicited events raised by an open link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Application message received on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// The link failed; it must be treated as unusable
    Error(LinkError),
    /// The remote end closed the connection
    Closed,
}

/// Channel an open link reports its events on
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Publish parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// Opens connections to a broker
#[async_trait]
pub trait MqttConnector: Send + Sync + 'static {
    /// Connect and wait for the broker's acknowledgement.
    ///
    /// Events raised by the link after this returns are sent on `events`.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MqttLink>, LinkError>;
}

/// An established connection to a broker
#[async_trait]
pub trait MqttLink: Send + Sync + 'static {
    /// Publish and wait until the broker acknowledges (immediately for QoS 0)
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), LinkError>;

    /// Subscribe and wait for the SUBACK
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError>;

    /// Unsubscribe and wait for the UNSUBACK
    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError>;

    /// Graceful teardown: send DISCONNECT and wait for the connection to close
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Drop the connection immediately without waiting for anything
    fn force_close(&self);
}
