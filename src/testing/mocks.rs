//! Fake MQTT connector for testing
//!
//! [`FakeBroker`] implements [`MqttConnector`] in memory. Tests script it (fail the
//! next connect, hold acknowledgements, hang a disconnect) and drive it (deliver
//! messages, drop the connection, answer provisioning requests) without a network.

use crate::error::LinkError;
use crate::provisioning::topics;
use crate::transport::{
    ConnectionConfig, LinkEvent, LinkEventSender, MqttConnector, MqttLink, PublishOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

/// A publish observed by the fake broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub options: PublishOptions,
}

impl PublishedMessage {
    /// Payload parsed as JSON, `Null` if it is not valid JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }

    /// The `$rid` embedded in the topic
    pub fn request_id(&self) -> Option<String> {
        topics::request_id_from_topic(&self.topic)
    }
}

#[derive(Default)]
struct BrokerState {
    connects: Vec<ConnectionConfig>,
    connect_failures: VecDeque<LinkError>,
    published: Vec<PublishedMessage>,
    publish_failures: VecDeque<LinkError>,
    subscriptions: Vec<String>,
    subscribe_failures: VecDeque<LinkError>,
    drop_after_subscribe: bool,
    unsubscriptions: Vec<String>,
    hang_disconnect: bool,
    disconnects: usize,
    force_closes: usize,
    events: Option<LinkEventSender>,
    current: Option<watch::Sender<bool>>,
}

struct Shared {
    state: Mutex<BrokerState>,
    acks_held: watch::Sender<bool>,
    connects_held: watch::Sender<bool>,
    publish_tx: mpsc::UnboundedSender<PublishedMessage>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker implementing [`MqttConnector`]
pub struct FakeBroker {
    shared: Arc<Shared>,
    publish_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PublishedMessage>>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                acks_held: watch::channel(false).0,
                connects_held: watch::channel(false).0,
                publish_tx,
            }),
            publish_rx: tokio::sync::Mutex::new(publish_rx),
        }
    }

    /// Make the next connection attempt fail with `error`
    pub fn fail_next_connect(&self, error: LinkError) {
        self.shared.state().connect_failures.push_back(error);
    }

    pub fn fail_next_publish(&self, error: LinkError) {
        self.shared.state().publish_failures.push_back(error);
    }

    pub fn fail_next_subscribe(&self, error: LinkError) {
        self.shared.state().subscribe_failures.push_back(error);
    }

    /// Close the connection right after the next subscription is acknowledged
    pub fn drop_after_next_subscribe(&self) {
        self.shared.state().drop_after_subscribe = true;
    }

    /// While held, publishes are recorded but not acknowledged
    pub fn hold_acks(&self, held: bool) {
        self.shared.acks_held.send_replace(held);
    }

    /// While held, connection attempts do not complete
    pub fn hold_connects(&self, held: bool) {
        self.shared.connects_held.send_replace(held);
    }

    /// Graceful disconnects never complete; only a forced close ends them
    pub fn hang_disconnect(&self, hang: bool) {
        self.shared.state().hang_disconnect = hang;
    }

    pub fn connects(&self) -> Vec<ConnectionConfig> {
        self.shared.state().connects.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.state().connects.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.state().subscriptions.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.shared.state().unsubscriptions.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.shared.state().disconnects
    }

    pub fn force_close_count(&self) -> usize {
        self.shared.state().force_closes
    }

    /// True while a link is open
    pub fn is_connected(&self) -> bool {
        self.shared
            .state()
            .current
            .as_ref()
            .is_some_and(|closed| !*closed.borrow())
    }

    /// Wait for the next publish to reach the broker
    pub async fn next_publish(&self) -> PublishedMessage {
        self.publish_rx
            .lock()
            .await
            .recv()
            .await
            .expect("fake broker keeps its publish channel open")
    }

    /// Deliver an application message on the open link
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) {
        self.send_event(LinkEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        });
    }

    /// The server closes the connection
    pub fn drop_connection(&self) {
        self.close_current();
        self.send_event(LinkEvent::Closed);
    }

    /// The link reports an error
    pub fn raise_error(&self, error: LinkError) {
        self.close_current();
        self.send_event(LinkEvent::Error(error));
    }

    /// Answer a provisioning request with `status`, extra query text (for example
    /// `&retry-after=5`) and a body
    pub fn reply(&self, request: &PublishedMessage, status: u16, extra_query: &str, body: &str) {
        let rid = request.request_id().unwrap_or_default();
        self.reply_to(&rid, status, extra_query, body);
    }

    /// Answer with an explicit request id
    pub fn reply_to(&self, request_id: &str, status: u16, extra_query: &str, body: &str) {
        let topic = format!("$dps/registrations/res/{status}/?$rid={request_id}{extra_query}");
        self.deliver(&topic, body.to_string());
    }

    fn send_event(&self, event: LinkEvent) {
        if let Some(events) = &self.shared.state().events {
            let _ = events.send(event);
        }
    }

    fn close_current(&self) {
        if let Some(closed) = &self.shared.state().current {
            closed.send_replace(true);
        }
    }
}

#[async_trait]
impl MqttConnector for FakeBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MqttLink>, LinkError> {
        let mut held = self.shared.connects_held.subscribe();
        while *held.borrow_and_update() {
            if held.changed().await.is_err() {
                break;
            }
        }

        let mut state = self.shared.state();
        state.connects.push(config.clone());
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }

        let (closed, _) = watch::channel(false);
        state.current = Some(closed.clone());
        state.events = Some(events);

        Ok(Arc::new(FakeLink {
            shared: self.shared.clone(),
            closed,
        }))
    }
}

/// Link handed out by [`FakeBroker`]
pub struct FakeLink {
    shared: Arc<Shared>,
    closed: watch::Sender<bool>,
}

impl FakeLink {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the link is closed
    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl MqttLink for FakeLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::new("client disconnecting"));
        }

        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
            options,
        };
        let failure = {
            let mut state = self.shared.state();
            state.published.push(message.clone());
            state.publish_failures.pop_front()
        };
        let _ = self.shared.publish_tx.send(message);
        if let Some(error) = failure {
            return Err(error);
        }

        let mut held = self.shared.acks_held.subscribe();
        loop {
            if self.is_closed() {
                return Err(LinkError::new("premature close"));
            }
            if !*held.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = held.changed() => {}
                _ = self.wait_closed() => {}
            }
        }
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::new("client disconnecting"));
        }
        let mut state = self.shared.state();
        state.subscriptions.push(topic.to_string());
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }
        if std::mem::take(&mut state.drop_after_subscribe) {
            self.closed.send_replace(true);
            if let Some(events) = &state.events {
                let _ = events.send(LinkEvent::Closed);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::new("client disconnecting"));
        }
        self.shared.state().unsubscriptions.push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let hang = {
            let mut state = self.shared.state();
            state.disconnects += 1;
            state.hang_disconnect
        };

        if hang {
            self.wait_closed().await;
            return Err(LinkError::new("premature close"));
        }
        self.closed.send_replace(true);
        Ok(())
    }

    fn force_close(&self) {
        self.shared.state().force_closes += 1;
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(
            "mqtt://localhost",
            "device",
            "user",
            crate::transport::mqtt::Credential::SharedAccessSignature("sig".to_string()),
        )
    }

    #[tokio::test]
    async fn test_fake_broker_records_traffic() {
        let broker = FakeBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = broker.connect(&config(), tx).await.unwrap();
        assert!(broker.is_connected());

        link.subscribe("a/#", QoS::AtLeastOnce).await.unwrap();
        link.publish("a/b", Bytes::from_static(b"{}"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.subscriptions(), vec!["a/#".to_string()]);
        assert_eq!(broker.next_publish().await.topic, "a/b");

        broker.deliver("a/c", "hi");
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Message {
                topic: "a/c".to_string(),
                payload: Bytes::from_static(b"hi")
            })
        );

        link.disconnect().await.unwrap();
        assert!(!broker.is_connected());
        assert_eq!(broker.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_held_ack_fails_on_force_close() {
        let broker = FakeBroker::new();
        broker.hold_acks(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = broker.connect(&config(), tx).await.unwrap();

        let publisher = link.clone();
        let publish = tokio::spawn(async move {
            publisher
                .publish("a/b", Bytes::new(), PublishOptions::default())
                .await
        });
        broker.next_publish().await;
        link.force_close();

        let result = publish.await.unwrap();
        assert_eq!(result, Err(LinkError::new("premature close")));
    }

    #[tokio::test]
    async fn test_drop_after_subscribe_closes_the_link() {
        let broker = FakeBroker::new();
        broker.drop_after_next_subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = broker.connect(&config(), tx).await.unwrap();

        link.subscribe("a/#", QoS::AtLeastOnce).await.unwrap();
        assert!(!broker.is_connected());
        assert_eq!(rx.recv().await, Some(LinkEvent::Closed));
    }

    #[tokio::test]
    async fn test_connect_failure_is_scripted() {
        let broker = FakeBroker::new();
        broker.fail_next_connect(LinkError::new("Connection refused: Not authorized"));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(broker.connect(&config(), tx.clone()).await.is_err());
        assert!(broker.connect(&config(), tx).await.is_ok());
        assert_eq!(broker.connect_count(), 2);
    }
}
