//! Impure I/O operations for the MQTT client
//!
//! This module owns the `rumqttc` event loop. It opens connections, drives the
//! event loop on a background task and turns its events into [`LinkEvent`]s and
//! acknowledgement completions. There is no reconnection here; a failed event
//! loop ends the link and the connection manager decides what happens next.

use super::connection::{configure_mqtt_options, ConnectionConfig};
use super::message_handler::{AckKind, AckTracker, EventRoute, MessageHandler};
use crate::error::LinkError;
use crate::transport::{LinkEvent, LinkEventSender, MqttConnector, MqttLink, PublishOptions};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Waiter = oneshot::Sender<Result<(), LinkError>>;

/// Opens connections with `rumqttc`
#[derive(Debug, Clone)]
pub struct RumqttcConnector {
    /// Capacity of the request channel between the client handle and its event loop
    pub capacity: usize,
    /// How long to wait for the CONNACK
    pub connect_timeout: Duration,
}

impl Default for RumqttcConnector {
    fn default() -> Self {
        Self {
            capacity: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl RumqttcConnector {
    /// Poll the event loop until the broker accepts or refuses the connection
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), LinkError> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| MessageHandler::link_error_from_connection(&e))?;

            match MessageHandler::route_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(()),
                EventRoute::ConnectionRefused(reason) => return Err(LinkError::new(reason)),
                other => debug!(target: "mqtt_transport", "Event before CONNACK: {:?}", other),
            }
        }
    }
}

#[async_trait]
impl MqttConnector for RumqttcConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MqttLink>, LinkError> {
        let options = configure_mqtt_options(config)?;
        let (client, mut event_loop) = AsyncClient::new(options, self.capacity);

        match tokio::time::timeout(self.connect_timeout, Self::wait_for_connack(&mut event_loop))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(LinkError::socket(
                    "TimedOut",
                    "CONNACK timeout - no connection confirmation received",
                ))
            }
        }
        info!(client_id = %config.client_id, "MQTT connection established");

        let shared = Arc::new(LinkShared::default());
        let (done_tx, done_rx) = watch::channel(false);
        let handle = tokio::spawn(drive_event_loop(
            event_loop,
            shared.clone(),
            events,
            done_tx,
        ));

        Ok(Arc::new(RumqttcLink {
            client,
            shared,
            send_lock: tokio::sync::Mutex::new(()),
            done: done_rx,
            handle: Mutex::new(Some(handle)),
        }))
    }
}

/// State shared between a link handle and its event loop task
#[derive(Default)]
struct LinkShared {
    tracker: Mutex<AckTracker<Waiter>>,
    closing: AtomicBool,
}

impl LinkShared {
    fn tracker(&self) -> MutexGuard<'_, AckTracker<Waiter>> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail_all(&self) {
        for waiter in self.tracker().drain() {
            let _ = waiter.send(Err(LinkError::new("premature close")));
        }
    }
}

/// Drive the event loop until it fails or the link is closed
async fn drive_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<LinkShared>,
    events: LinkEventSender,
    done: watch::Sender<bool>,
) {
    loop {
        let event = match event_loop.poll().await {
            Ok(event) => event,
            Err(e) => {
                if shared.closing.load(Ordering::SeqCst) {
                    debug!(target: "mqtt_transport", "Event loop ended during disconnect: {}", e);
                } else {
                    warn!(target: "mqtt_transport", "MQTT event loop error: {}", e);
                    let _ = events.send(MessageHandler::loop_error_event(&e));
                }
                break;
            }
        };

        match MessageHandler::route_event(&event) {
            EventRoute::MessageReceived { topic, payload } => {
                let _ = events.send(LinkEvent::Message { topic, payload });
            }
            EventRoute::Sent { kind, pkid } => {
                if let Some(waiter) = shared.tracker().on_sent(kind, pkid) {
                    let _ = waiter.send(Ok(()));
                }
            }
            EventRoute::Acknowledged {
                kind,
                pkid,
                success,
            } => {
                if let Some(waiter) = shared.tracker().on_ack(kind, pkid) {
                    let result = if success {
                        Ok(())
                    } else {
                        Err(LinkError::new("subscription refused by broker"))
                    };
                    let _ = waiter.send(result);
                }
            }
            EventRoute::DisconnectSent => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
            }
            EventRoute::Disconnected => {
                let _ = events.send(LinkEvent::Closed);
                break;
            }
            other => debug!(target: "mqtt_transport", "MQTT event: {:?}", other),
        }
    }

    shared.fail_all();
    let _ = done.send(true);
}

fn check_topic_name(topic: &str) -> Result<(), LinkError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(LinkError::new(format!("Invalid topic {topic}")));
    }
    Ok(())
}

fn check_topic_filter(filter: &str) -> Result<(), LinkError> {
    if filter.is_empty() {
        return Err(LinkError::new("Invalid topic filter"));
    }
    Ok(())
}

/// An open `rumqttc` connection
pub struct RumqttcLink {
    client: AsyncClient,
    shared: Arc<LinkShared>,
    /// Keeps waiter registration in the same order as requests reach the event loop
    send_lock: tokio::sync::Mutex<()>,
    done: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcLink {
    /// Register a waiter, hand the request to the client and wait for the acknowledgement
    async fn request<F, Fut>(&self, kind: AckKind, qos: QoS, send: F) -> Result<(), LinkError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        let (tx, rx) = oneshot::channel();
        {
            let _guard = self.send_lock.lock().await;
            self.shared.tracker().expect(kind, qos, tx);
            if let Err(e) = send().await {
                self.shared.tracker().cancel_last();
                return Err(LinkError::new(format!("No connection to broker: {e}")));
            }
        }

        rx.await
            .unwrap_or_else(|_| Err(LinkError::new("premature close")))
    }
}

#[async_trait]
impl MqttLink for RumqttcLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), LinkError> {
        check_topic_name(topic)?;
        self.request(AckKind::Publish, options.qos, || {
            self.client
                .publish_bytes(topic, options.qos, options.retain, payload)
        })
        .await
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        check_topic_filter(topic)?;
        self.request(AckKind::Subscribe, qos, || self.client.subscribe(topic, qos))
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        check_topic_filter(topic)?;
        self.request(AckKind::Unsubscribe, QoS::AtLeastOnce, || {
            self.client.unsubscribe(topic)
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!(target: "mqtt_transport", "Event loop already stopped: {}", e);
        }

        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
        info!("MQTT client disconnected");
        Ok(())
    }

    fn force_close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.shared.fail_all();
    }
}

impl Drop for RumqttcLink {
    fn drop(&mut self) {
        // The event loop task owns the socket; stop it with the handle.
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::Credential;
    use tokio::sync::mpsc;

    #[test]
    fn test_topic_checks() {
        assert!(check_topic_name("$dps/registrations/PUT/iotdps-register/?$rid=1").is_ok());
        assert!(check_topic_name("").is_err());
        let error = check_topic_name("a/#").unwrap_err();
        assert!(error.message.starts_with("Invalid topic"));

        assert!(check_topic_filter("$dps/registrations/res/#").is_ok());
        assert!(check_topic_filter("").is_err());
    }

    #[test]
    fn test_fail_all_completes_waiters() {
        let shared = LinkShared::default();
        let (tx, mut rx) = oneshot::channel();
        shared
            .tracker()
            .expect(AckKind::Publish, QoS::AtLeastOnce, tx);

        shared.fail_all();
        let result = rx.try_recv().unwrap();
        assert_eq!(result, Err(LinkError::new("premature close")));
        assert!(shared.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let connector = RumqttcConnector {
            capacity: 10,
            connect_timeout: Duration::from_secs(5),
        };
        let config = ConnectionConfig::new(
            "mqtt://127.0.0.1:1",
            "device",
            "user",
            Credential::SharedAccessSignature("sig".to_string()),
        );
        let (events, _rx) = mpsc::unbounded_channel();

        let result = connector.connect(&config, events).await;
        let error = result.err().expect("connection should fail");
        assert!(error.code.is_some(), "expected a socket error, got {error:?}");
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_uri() {
        let connector = RumqttcConnector::default();
        let config = ConnectionConfig::new(
            "http://example.net",
            "device",
            "user",
            Credential::SharedAccessSignature("sig".to_string()),
        );
        let (events, _rx) = mpsc::unbounded_channel();
        assert!(connector.connect(&config, events).await.is_err());
    }
}
