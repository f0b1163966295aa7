//! Connection manager state machine
//!
//! A [`ConnectionManager`] is a cheap, cloneable handle to an actor task that owns
//! the MQTT link. Every state transition happens inside that task. Network I/O runs
//! in spawned tasks that post their completions back to the actor, so the state
//! itself is never shared.
//!
//! Commands that arrive while the manager is connecting, disconnecting or
//! reconnecting are queued and replayed in arrival order once it settles in
//! `Connected` or `Disconnected`.

use super::connection::{
    ConnectionConfig, ConnectionState, Credential, RECONNECT_DISCONNECT_TIMEOUT,
};
use crate::correlation::{IdGenerator, RandomIdGenerator};
use crate::error::{redact_secrets, translate_link_error, LinkError, TransportError, TransportResult};
use crate::observability::metrics;
use crate::transport::{LinkEvent, MqttConnector, MqttLink, PublishOptions};
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Notifications emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The manager entered a new state
    StateChanged(ConnectionState),
    /// Application message received on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// The connection was lost without any caller asking for it
    Disconnected(TransportError),
}

/// Receiving half of the manager's event channel
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

type Responder = oneshot::Sender<TransportResult<()>>;

/// Tunables for a [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Source of the ids that key in-flight publishes
    pub id_generator: Arc<dyn IdGenerator>,
    /// How long a credential update waits for the old link to close
    pub reconnect_disconnect_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            id_generator: Arc::new(RandomIdGenerator),
            reconnect_disconnect_timeout: RECONNECT_DISCONNECT_TIMEOUT,
        }
    }
}

enum Command {
    Connect {
        config: ConnectionConfig,
        respond: Responder,
    },
    Disconnect {
        respond: Responder,
    },
    Publish {
        topic: String,
        payload: Bytes,
        options: PublishOptions,
        respond: Responder,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        respond: Responder,
    },
    Unsubscribe {
        topic: String,
        respond: Responder,
    },
    UpdateCredential {
        credential: Credential,
        respond: Responder,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::Publish { .. } => "publish",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::UpdateCredential { .. } => "update_credential",
        }
    }

    fn reject(self, error: TransportError) {
        let respond = match self {
            Command::Connect { respond, .. }
            | Command::Disconnect { respond }
            | Command::Publish { respond, .. }
            | Command::Subscribe { respond, .. }
            | Command::Unsubscribe { respond, .. }
            | Command::UpdateCredential { respond, .. } => respond,
        };
        let _ = respond.send(Err(error));
    }
}

/// Completions posted back to the actor by the tasks it spawns
enum Internal {
    Connected {
        generation: u64,
        result: Result<Arc<dyn MqttLink>, LinkError>,
    },
    TornDown {
        generation: u64,
        result: Result<(), LinkError>,
    },
    PublishDone {
        id: Uuid,
        result: Result<(), LinkError>,
    },
    Link {
        generation: u64,
        event: LinkEvent,
    },
}

/// A publish waiting for its acknowledgement
struct PendingPublish {
    id: Uuid,
    enqueued_at: Instant,
    respond: Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectPhase {
    TearingDown,
    Connecting,
}

/// Handle to a connection manager actor
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl ConnectionManager {
    /// Start a manager on the current tokio runtime.
    ///
    /// The actor stops once every handle has been dropped.
    pub fn new(connector: Arc<dyn MqttConnector>) -> (Self, ConnectionEvents) {
        Self::with_settings(connector, ManagerSettings::default())
    }

    pub fn with_id_generator(
        connector: Arc<dyn MqttConnector>,
        id_generator: Arc<dyn IdGenerator>,
    ) -> (Self, ConnectionEvents) {
        Self::with_settings(
            connector,
            ManagerSettings {
                id_generator,
                ..ManagerSettings::default()
            },
        )
    }

    pub fn with_settings(
        connector: Arc<dyn MqttConnector>,
        settings: ManagerSettings,
    ) -> (Self, ConnectionEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ConnectionActor {
            connector,
            ids: settings.id_generator,
            reconnect_timeout: settings.reconnect_disconnect_timeout,
            state: ConnectionState::Disconnected,
            state_tx,
            events: event_tx,
            internal_tx,
            config: None,
            stored_credential: None,
            link: None,
            generation: 0,
            waiter: None,
            reconnect_phase: None,
            deadline: None,
            pending_publishes: HashMap::new(),
            deferred: VecDeque::new(),
        };
        tokio::spawn(
            actor
                .run(command_rx, internal_rx)
                .instrument(crate::mqtt_span!(component = "connection_manager")),
        );

        (
            Self {
                commands: command_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    /// Current state of the connection
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel following every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Open the connection. Fails with `Argument` before any I/O if the configuration
    /// is incomplete.
    pub async fn connect(&self, config: ConnectionConfig) -> TransportResult<()> {
        config.validate()?;
        self.call(|respond| Command::Connect { config, respond })
            .await
    }

    /// Close the connection. Succeeds immediately when already disconnected.
    pub async fn disconnect(&self) -> TransportResult<()> {
        self.call(|respond| Command::Disconnect { respond }).await
    }

    /// Publish and wait for the broker's acknowledgement.
    ///
    /// Fails with `NotConnected` while disconnected, and with the disconnect error if
    /// the connection drops before the acknowledgement arrives.
    pub async fn publish<T, P>(
        &self,
        topic: T,
        payload: P,
        options: PublishOptions,
    ) -> TransportResult<()>
    where
        T: Into<String>,
        P: Into<Bytes>,
    {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(TransportError::argument("topic is required"));
        }
        let payload = payload.into();
        self.call(|respond| Command::Publish {
            topic,
            payload,
            options,
            respond,
        })
        .await
    }

    /// Subscribe to a topic filter and wait for the SUBACK.
    pub async fn subscribe<T: Into<String>>(&self, topic: T, qos: QoS) -> TransportResult<()> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(TransportError::argument("topic is required"));
        }
        self.call(|respond| Command::Subscribe {
            topic,
            qos,
            respond,
        })
        .await
    }

    /// Remove a subscription and wait for the UNSUBACK.
    pub async fn unsubscribe<T: Into<String>>(&self, topic: T) -> TransportResult<()> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(TransportError::argument("topic is required"));
        }
        self.call(|respond| Command::Unsubscribe { topic, respond })
            .await
    }

    /// Replace the credential.
    ///
    /// While connected this disconnects and reconnects with the new credential,
    /// forcing the old connection closed if it does not go away within the
    /// reconnect timeout. The result is that of the reconnect. While disconnected
    /// the credential is kept for the next `connect`.
    pub async fn update_credential(&self, credential: Credential) -> TransportResult<()> {
        if let Credential::SharedAccessSignature(sas) = &credential {
            if sas.trim().is_empty() {
                return Err(TransportError::argument(
                    "shared access signature must not be empty",
                ));
            }
        }
        self.call(|respond| Command::UpdateCredential {
            credential,
            respond,
        })
        .await
    }

    async fn call<F>(&self, build: F) -> TransportResult<()>
    where
        F: FnOnce(Responder) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| TransportError::not_connected("connection manager has shut down"))?;
        rx.await.unwrap_or_else(|_| {
            Err(TransportError::not_connected(
                "connection manager has shut down",
            ))
        })
    }
}

struct ConnectionActor {
    connector: Arc<dyn MqttConnector>,
    ids: Arc<dyn IdGenerator>,
    reconnect_timeout: Duration,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Configuration of the current (or last) connection
    config: Option<ConnectionConfig>,
    /// Credential supplied while disconnected, applied on the next connect
    stored_credential: Option<Credential>,
    link: Option<Arc<dyn MqttLink>>,
    /// Incremented for every connection attempt; completions from older attempts are ignored
    generation: u64,
    /// Caller waiting for the transition in progress
    waiter: Option<Responder>,
    reconnect_phase: Option<ReconnectPhase>,
    deadline: Option<Instant>,
    pending_publishes: HashMap<Uuid, PendingPublish>,
    deferred: VecDeque<Command>,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        debug!("Connection manager started");
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_disconnect_timeout();
                }
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        if self.state.is_transitional() {
            debug!(command = command.name(), state = %self.state, "Deferring command until the transition completes");
            self.deferred.push_back(command);
            return;
        }

        match self.state {
            ConnectionState::Disconnected => self.handle_disconnected(command),
            ConnectionState::Connected => self.handle_connected(command),
            _ => self.deferred.push_back(command),
        }
    }

    fn handle_disconnected(&mut self, command: Command) {
        match command {
            Command::Connect {
                mut config,
                respond,
            } => {
                if let Some(credential) = self.stored_credential.take() {
                    config.credential = Some(credential);
                }
                info!(uri = %config.uri, client_id = %config.client_id, "Connecting");
                self.transition(ConnectionState::Connecting);
                self.waiter = Some(respond);
                self.start_connect(config);
            }
            Command::Disconnect { respond } => {
                let _ = respond.send(Ok(()));
            }
            Command::UpdateCredential {
                credential,
                respond,
            } => {
                debug!("Storing credential for the next connection");
                self.stored_credential = Some(credential);
                let _ = respond.send(Ok(()));
            }
            other => {
                debug!(command = other.name(), "Rejecting command while disconnected");
                other.reject(TransportError::not_connected("not connected"));
            }
        }
    }

    fn handle_connected(&mut self, command: Command) {
        let Some(link) = self.link.clone() else {
            command.reject(TransportError::not_connected("no open connection"));
            return;
        };

        match command {
            Command::Connect { respond, .. } => {
                debug!("Already connected");
                let _ = respond.send(Ok(()));
            }
            Command::Disconnect { respond } => {
                info!("Disconnecting");
                self.transition(ConnectionState::Disconnecting);
                self.waiter = Some(respond);
                self.start_teardown(link);
            }
            Command::Publish {
                topic,
                payload,
                options,
                respond,
            } => {
                let id = self.ids.next_id();
                debug!(%id, %topic, bytes = payload.len(), "Publishing");
                metrics().publish_started();
                self.pending_publishes.insert(
                    id,
                    PendingPublish {
                        id,
                        enqueued_at: Instant::now(),
                        respond,
                    },
                );

                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = link.publish(&topic, payload, options).await;
                    let _ = internal.send(Internal::PublishDone { id, result });
                });
            }
            Command::Subscribe {
                topic,
                qos,
                respond,
            } => {
                debug!(%topic, ?qos, "Subscribing");
                tokio::spawn(async move {
                    let result = link
                        .subscribe(&topic, qos)
                        .await
                        .map_err(translate_link_error);
                    let _ = respond.send(result);
                });
            }
            Command::Unsubscribe { topic, respond } => {
                debug!(%topic, "Unsubscribing");
                tokio::spawn(async move {
                    let result = link.unsubscribe(&topic).await.map_err(translate_link_error);
                    let _ = respond.send(result);
                });
            }
            Command::UpdateCredential {
                credential,
                respond,
            } => {
                info!("Credential updated, reconnecting");
                match self.config.as_mut() {
                    Some(config) => config.credential = Some(credential),
                    None => self.stored_credential = Some(credential),
                }
                self.transition(ConnectionState::Reconnecting);
                self.waiter = Some(respond);
                self.reconnect_phase = Some(ReconnectPhase::TearingDown);
                self.deadline = Some(Instant::now() + self.reconnect_timeout);
                self.start_teardown(link);
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Connected { generation, result } => self.on_connected(generation, result),
            Internal::TornDown { generation, result } => self.on_torn_down(generation, result),
            Internal::PublishDone { id, result } => self.on_publish_done(id, result),
            Internal::Link { generation, event } => self.on_link_event(generation, event),
        }
    }

    fn on_connected(&mut self, generation: u64, result: Result<Arc<dyn MqttLink>, LinkError>) {
        if generation != self.generation {
            if let Ok(link) = result {
                debug!(generation, "Closing link from an abandoned connection attempt");
                link.force_close();
            }
            return;
        }

        match result {
            Ok(link) => {
                info!("Connected");
                metrics().connection_established();
                self.link = Some(link);
                self.reconnect_phase = None;
                self.transition(ConnectionState::Connected);
                if let Some(waiter) = self.waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
                self.replay_deferred();
            }
            Err(e) => {
                warn!(error = %redact_secrets(&e.message), "Connection attempt failed");
                metrics().connection_failed();
                self.enter_disconnected(Some(translate_link_error(e)));
            }
        }
    }

    fn on_torn_down(&mut self, generation: u64, result: Result<(), LinkError>) {
        if generation != self.generation {
            return;
        }
        if let Err(e) = result {
            warn!(error = %e, "Graceful disconnect failed");
        }

        match (self.state, self.reconnect_phase) {
            (ConnectionState::Disconnecting, _) => {
                self.link = None;
                self.enter_disconnected(None);
            }
            (ConnectionState::Reconnecting, Some(ReconnectPhase::TearingDown)) => {
                debug!("Old connection closed");
                self.reconnect_after_teardown();
            }
            _ => {}
        }
    }

    fn on_disconnect_timeout(&mut self) {
        self.deadline = None;
        if self.state != ConnectionState::Reconnecting
            || self.reconnect_phase != Some(ReconnectPhase::TearingDown)
        {
            return;
        }

        warn!(
            timeout_secs = self.reconnect_timeout.as_secs(),
            "Disconnect did not complete in time, forcing the connection closed"
        );
        if let Some(link) = self.link.take() {
            link.force_close();
        }
        self.reconnect_after_teardown();
    }

    fn reconnect_after_teardown(&mut self) {
        self.deadline = None;
        self.link = None;
        self.purge_publishes(&TransportError::not_connected(
            "connection closed for credential update",
        ));

        match self.config.clone() {
            Some(config) => {
                self.reconnect_phase = Some(ReconnectPhase::Connecting);
                self.start_connect(config);
            }
            None => self.enter_disconnected(Some(TransportError::not_connected(
                "no configuration to reconnect with",
            ))),
        }
    }

    fn on_publish_done(&mut self, id: Uuid, result: Result<(), LinkError>) {
        let Some(pending) = self.pending_publishes.remove(&id) else {
            debug!(%id, "Acknowledgement for a publish that was already resolved");
            return;
        };

        let elapsed_ms = pending.enqueued_at.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                debug!(id = %pending.id, elapsed_ms, "Publish acknowledged");
                metrics().publish_acknowledged();
                let _ = pending.respond.send(Ok(()));
            }
            Err(e) => {
                warn!(id = %pending.id, elapsed_ms, error = %e, "Publish failed");
                metrics().publish_failed();
                let _ = pending.respond.send(Err(translate_link_error(e)));
            }
        }
    }

    fn on_link_event(&mut self, generation: u64, event: LinkEvent) {
        if generation != self.generation {
            return;
        }

        match event {
            LinkEvent::Message { topic, payload } => {
                debug!(%topic, bytes = payload.len(), "Message received");
                metrics().message_received();
                let _ = self
                    .events
                    .send(ConnectionEvent::Message { topic, payload });
            }
            LinkEvent::Closed if self.state == ConnectionState::Connected => {
                warn!("Connection closed by the server");
                self.link = None;
                self.enter_disconnected(Some(TransportError::not_connected(
                    "connection to the server has been closed",
                )));
            }
            LinkEvent::Error(e) if self.state == ConnectionState::Connected => {
                warn!(error = %redact_secrets(&e.message), "Connection error");
                self.transition(ConnectionState::Disconnecting);
                if let Some(link) = self.link.take() {
                    link.force_close();
                }
                self.enter_disconnected(Some(translate_link_error(e)));
            }
            other => {
                debug!(event = ?other, state = %self.state, "Ignoring link event during transition");
            }
        }
    }

    fn start_connect(&mut self, config: ConnectionConfig) {
        self.generation += 1;
        let generation = self.generation;
        self.config = Some(config.clone());
        metrics().connection_attempted();

        let connector = self.connector.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let (link_tx, mut link_rx) = mpsc::unbounded_channel();
            let result = connector.connect(&config, link_tx).await;
            let connected = result.is_ok();
            if internal
                .send(Internal::Connected { generation, result })
                .is_err()
                || !connected
            {
                return;
            }

            // Same task as the connect completion, so link events can never overtake it.
            while let Some(event) = link_rx.recv().await {
                if internal.send(Internal::Link { generation, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn start_teardown(&mut self, link: Arc<dyn MqttLink>) {
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = link.disconnect().await;
            let _ = internal.send(Internal::TornDown { generation, result });
        });
    }

    fn enter_disconnected(&mut self, error: Option<TransportError>) {
        self.link = None;
        self.deadline = None;
        self.reconnect_phase = None;
        metrics().connection_lost();
        self.transition(ConnectionState::Disconnected);

        let purge_error = error
            .clone()
            .unwrap_or_else(|| TransportError::not_connected("connection closed"));
        self.purge_publishes(&purge_error);

        match (self.waiter.take(), error) {
            (Some(waiter), error) => {
                let _ = waiter.send(error.map_or(Ok(()), Err));
            }
            (None, Some(error)) => {
                let _ = self.events.send(ConnectionEvent::Disconnected(error));
            }
            (None, None) => {}
        }

        self.replay_deferred();
    }

    fn purge_publishes(&mut self, error: &TransportError) {
        if self.pending_publishes.is_empty() {
            return;
        }
        info!(count = self.pending_publishes.len(), error = %error, "Failing in-flight publishes");
        for (_, pending) in self.pending_publishes.drain() {
            metrics().publish_failed();
            let _ = pending.respond.send(Err(error.clone()));
        }
    }

    fn replay_deferred(&mut self) {
        let queued = std::mem::take(&mut self.deferred);
        if !queued.is_empty() {
            debug!(count = queued.len(), "Replaying deferred commands");
        }
        for command in queued {
            self.handle_command(command);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "Connection state changed");
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events.send(ConnectionEvent::StateChanged(next));
    }

    fn shutdown(&mut self) {
        debug!("Connection manager stopping");
        if let Some(link) = self.link.take() {
            link.force_close();
        }
        let error = TransportError::not_connected("connection manager has shut down");
        self.purge_publishes(&error);
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(error.clone()));
        }
        for command in self.deferred.drain(..) {
            command.reject(error.clone());
        }
        self.state = ConnectionState::Disconnected;
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}
