//! Provisioning session: request/response correlation over MQTT
//!
//! A [`ProvisioningSession`] owns a [`ConnectionManager`] and runs its own state
//! machine on top of it. Every registration or status query gets a fresh
//! correlation id that travels in the request topic's `$rid` parameter. Responses
//! are matched back to the waiting caller by that id.
//!
//! The session connects on demand. The first request issued while disconnected
//! opens the connection and subscribes to the response topics; requests issued
//! meanwhile are queued and published once the connection is up.

use super::messages::{
    interpret_response, operation_status_body, registration_body, OperationKind,
    RegistrationRequest, RegistrationResponse, DEFAULT_POLLING_INTERVAL,
};
use super::topics::{self, RESPONSE_SUBSCRIPTION};
use crate::correlation::{IdGenerator, RandomIdGenerator};
use crate::error::{TransportError, TransportResult};
use crate::observability::metrics;
use crate::transport::mqtt::{
    ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionManager, ConnectionState,
    Credential, DEFAULT_KEEP_ALIVE,
};
use crate::transport::{MqttConnector, PublishOptions};
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Global device provisioning endpoint
pub const DEFAULT_GLOBAL_ENDPOINT: &str = "global.azure-devices-provisioning.net";

/// Port the provisioning service accepts MQTT over TLS on
pub const PROVISIONING_PORT: u16 = 8883;

/// Client version reported to the service
pub const DEFAULT_USER_AGENT: &str = concat!("dps-mqtt/", env!("CARGO_PKG_VERSION"));

/// Everything the session needs to open connections
#[derive(Debug, Clone)]
pub struct ProvisioningSettings {
    pub global_endpoint: String,
    pub id_scope: String,
    pub credential: Credential,
    /// Replaces `mqtts://<global_endpoint>:8883`, for local brokers
    pub broker_url: Option<String>,
    pub ca_certificate: Option<Vec<u8>>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Used when a response carries no `retry-after`
    pub polling_interval: Duration,
    pub user_agent: String,
}

impl ProvisioningSettings {
    pub fn new<S: Into<String>>(id_scope: S, credential: Credential) -> Self {
        Self {
            global_endpoint: DEFAULT_GLOBAL_ENDPOINT.to_string(),
            id_scope: id_scope.into(),
            credential,
            broker_url: None,
            ca_certificate: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Broker URI derived from the endpoint unless overridden
    pub fn broker_uri(&self) -> String {
        self.broker_url.clone().unwrap_or_else(|| {
            format!("mqtts://{}:{PROVISIONING_PORT}", self.global_endpoint)
        })
    }

    /// Connection parameters for registering `registration_id`
    pub fn connection_config(&self, registration_id: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(
            self.broker_uri(),
            registration_id,
            topics::username(&self.id_scope, registration_id, &self.user_agent),
            self.credential.clone(),
        )
        .with_keep_alive(self.keep_alive)
        .with_clean_session(self.clean_session);
        config.ca_certificate = self.ca_certificate.clone();
        config
    }
}

/// Notifications emitted by the session
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningEvent {
    StateChanged(ConnectionState),
    /// The connection was lost while operations may have been outstanding
    Error(TransportError),
}

pub type ProvisioningEvents = mpsc::UnboundedReceiver<ProvisioningEvent>;

type Responder = oneshot::Sender<TransportResult<()>>;
type OperationResponder = oneshot::Sender<TransportResult<RegistrationResponse>>;

enum SessionCommand {
    Request {
        request: RegistrationRequest,
        kind: OperationKind,
        respond: OperationResponder,
    },
    Cancel {
        respond: Responder,
    },
    Disconnect {
        respond: Responder,
    },
    UpdateCredential {
        credential: Credential,
        respond: Responder,
    },
}

/// Work waiting for the current transition to finish
enum Deferred {
    Publish(Uuid),
    Disconnect(Responder),
    UpdateCredential(Credential, Responder),
}

enum SessionInternal {
    ConnectDone(TransportResult<()>),
    PublishDone {
        request_id: Uuid,
        result: TransportResult<()>,
    },
    DisconnectDone(TransportResult<()>),
    ReconnectDone(TransportResult<()>),
}

/// An outstanding registration or status query
struct PendingOperation {
    kind: OperationKind,
    registration_id: String,
    topic: String,
    body: Bytes,
    issued_at: Instant,
    respond: OperationResponder,
}

/// Handle to a provisioning session actor
#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ProvisioningSession {
    /// Start a session with its own connection manager
    pub fn new(
        connector: Arc<dyn MqttConnector>,
        settings: ProvisioningSettings,
    ) -> (Self, ProvisioningEvents) {
        Self::with_id_generator(connector, settings, Arc::new(RandomIdGenerator))
    }

    /// Start a session whose correlation ids come from `ids`
    pub fn with_id_generator(
        connector: Arc<dyn MqttConnector>,
        settings: ProvisioningSettings,
        ids: Arc<dyn IdGenerator>,
    ) -> (Self, ProvisioningEvents) {
        let (manager, connection_events) = ConnectionManager::new(connector);
        Self::with_connection_manager(manager, connection_events, settings, ids)
    }

    /// Start a session on an existing connection manager. The session must be the
    /// only consumer of `connection_events`.
    pub fn with_connection_manager(
        manager: ConnectionManager,
        connection_events: ConnectionEvents,
        settings: ProvisioningSettings,
        ids: Arc<dyn IdGenerator>,
    ) -> (Self, ProvisioningEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let span = crate::provisioning_span!(id_scope = %settings.id_scope);

        let actor = SessionActor {
            manager,
            settings,
            ids,
            state: ConnectionState::Disconnected,
            state_tx,
            events: event_tx,
            internal_tx,
            pending: HashMap::new(),
            deferred: VecDeque::new(),
            waiter: None,
            lost_during_transition: None,
        };
        tokio::spawn(
            actor
                .run(command_rx, internal_rx, connection_events)
                .instrument(span),
        );

        (
            Self {
                commands: command_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Register a device. Connects first if needed.
    pub async fn registration_request(
        &self,
        request: RegistrationRequest,
    ) -> TransportResult<RegistrationResponse> {
        if request.registration_id.trim().is_empty() {
            return Err(TransportError::argument("registration id is required"));
        }
        self.operation(request, OperationKind::Registration).await
    }

    /// Poll the status of a registration started earlier
    pub async fn query_operation_status(
        &self,
        request: RegistrationRequest,
        operation_id: &str,
    ) -> TransportResult<RegistrationResponse> {
        if request.registration_id.trim().is_empty() {
            return Err(TransportError::argument("registration id is required"));
        }
        if operation_id.trim().is_empty() {
            return Err(TransportError::argument("operation id is required"));
        }
        let kind = OperationKind::OperationStatusQuery {
            operation_id: operation_id.to_string(),
        };
        self.operation(request, kind).await
    }

    /// Fail every outstanding operation with `OperationCancelled`. The connection stays up.
    pub async fn cancel(&self) -> TransportResult<()> {
        self.call(|respond| SessionCommand::Cancel { respond }).await
    }

    /// Cancel outstanding operations and close the connection
    pub async fn disconnect(&self) -> TransportResult<()> {
        self.call(|respond| SessionCommand::Disconnect { respond })
            .await
    }

    /// Replace the credential, reconnecting if connected
    pub async fn update_credential(&self, credential: Credential) -> TransportResult<()> {
        if let Credential::SharedAccessSignature(sas) = &credential {
            if sas.trim().is_empty() {
                return Err(TransportError::argument(
                    "shared access signature must not be empty",
                ));
            }
        }
        self.call(|respond| SessionCommand::UpdateCredential {
            credential,
            respond,
        })
        .await
    }

    async fn operation(
        &self,
        request: RegistrationRequest,
        kind: OperationKind,
    ) -> TransportResult<RegistrationResponse> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Request {
                request,
                kind,
                respond: tx,
            })
            .map_err(|_| session_closed())?;
        rx.await.unwrap_or_else(|_| Err(session_closed()))
    }

    async fn call<F>(&self, build: F) -> TransportResult<()>
    where
        F: FnOnce(Responder) -> SessionCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| session_closed())?;
        rx.await.unwrap_or_else(|_| Err(session_closed()))
    }
}

fn connection_lost_error(error: &TransportError) -> TransportError {
    TransportError::cancelled(format!(
        "connection lost before a response arrived: {error}"
    ))
}

fn session_closed() -> TransportError {
    TransportError::cancelled("provisioning session has shut down")
}

struct SessionActor {
    manager: ConnectionManager,
    settings: ProvisioningSettings,
    ids: Arc<dyn IdGenerator>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ProvisioningEvent>,
    internal_tx: mpsc::UnboundedSender<SessionInternal>,
    pending: HashMap<Uuid, PendingOperation>,
    deferred: VecDeque<Deferred>,
    /// Caller of the disconnect or credential update in progress
    waiter: Option<Responder>,
    /// Connection loss reported while connecting or reconnecting, applied once the
    /// transition completes
    lost_during_transition: Option<TransportError>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut internal: mpsc::UnboundedReceiver<SessionInternal>,
        mut connection_events: ConnectionEvents,
    ) {
        let mut connection_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                event = connection_events.recv(), if connection_open => match event {
                    Some(event) => self.handle_connection_event(event),
                    None => connection_open = false,
                },
            }
        }
        self.shutdown().await;
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Request {
                request,
                kind,
                respond,
            } => self.start_operation(request, kind, respond),
            SessionCommand::Cancel { respond } => {
                self.purge(TransportError::cancelled("operation cancelled by caller"));
                let _ = respond.send(Ok(()));
            }
            SessionCommand::Disconnect { respond } => {
                self.purge(TransportError::cancelled(
                    "session disconnected before a response arrived",
                ));
                self.dispatch(Deferred::Disconnect(respond));
            }
            SessionCommand::UpdateCredential {
                credential,
                respond,
            } => self.dispatch(Deferred::UpdateCredential(credential, respond)),
        }
    }

    fn start_operation(
        &mut self,
        request: RegistrationRequest,
        kind: OperationKind,
        respond: OperationResponder,
    ) {
        let request_id = self.ids.next_id();
        let built = match &kind {
            OperationKind::Registration => registration_body(&request)
                .map(|body| (topics::registration_topic(&request_id), body)),
            OperationKind::OperationStatusQuery { operation_id } => {
                operation_status_body(&request)
                    .map(|body| (topics::operation_status_topic(&request_id, operation_id), body))
            }
        };
        let (topic, body) = match built {
            Ok(built) => built,
            Err(e) => {
                let _ = respond.send(Err(e));
                return;
            }
        };

        info!(%request_id, operation = kind.name(), registration_id = %request.registration_id, "Issuing provisioning request");
        metrics().operation_started();
        self.pending.insert(
            request_id,
            PendingOperation {
                kind,
                registration_id: request.registration_id,
                topic,
                body,
                issued_at: Instant::now(),
                respond,
            },
        );

        self.dispatch(Deferred::Publish(request_id));
    }

    /// Run `work` now if the session is settled, otherwise queue it
    fn dispatch(&mut self, work: Deferred) {
        if self.state.is_transitional() {
            self.deferred.push_back(work);
            return;
        }

        match work {
            Deferred::Publish(request_id) => self.publish(request_id),
            Deferred::Disconnect(respond) => self.start_disconnect(respond),
            Deferred::UpdateCredential(credential, respond) => {
                self.start_credential_update(credential, respond)
            }
        }
    }

    fn publish(&mut self, request_id: Uuid) {
        let Some(operation) = self.pending.get(&request_id) else {
            debug!(%request_id, "Operation was cancelled before it was published");
            return;
        };
        if self.state == ConnectionState::Disconnected {
            let registration_id = operation.registration_id.clone();
            self.start_connect(&registration_id);
            self.deferred.push_back(Deferred::Publish(request_id));
            return;
        }

        debug!(%request_id, topic = %operation.topic, "Publishing provisioning request");
        let manager = self.manager.clone();
        let topic = operation.topic.clone();
        let body = operation.body.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = manager.publish(topic, body, PublishOptions::default()).await;
            let _ = internal.send(SessionInternal::PublishDone { request_id, result });
        });
    }

    fn start_connect(&mut self, registration_id: &str) {
        let config = self.settings.connection_config(registration_id);
        info!(uri = %config.uri, %registration_id, "Connecting to the provisioning service");
        self.transition(ConnectionState::Connecting);

        let manager = self.manager.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connect_and_subscribe(&manager, config).await;
            let _ = internal.send(SessionInternal::ConnectDone(result));
        });
    }

    fn start_disconnect(&mut self, respond: Responder) {
        if self.state == ConnectionState::Disconnected {
            let _ = respond.send(Ok(()));
            return;
        }

        info!("Disconnecting from the provisioning service");
        self.transition(ConnectionState::Disconnecting);
        self.waiter = Some(respond);
        let manager = self.manager.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = manager.disconnect().await;
            let _ = internal.send(SessionInternal::DisconnectDone(result));
        });
    }

    fn start_credential_update(&mut self, credential: Credential, respond: Responder) {
        self.settings.credential = credential.clone();
        if self.state == ConnectionState::Disconnected {
            debug!("Credential stored for the next connection");
            let _ = respond.send(Ok(()));
            return;
        }

        info!("Reconnecting with a new credential");
        self.transition(ConnectionState::Reconnecting);
        self.waiter = Some(respond);
        let manager = self.manager.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = reconnect_and_subscribe(&manager, credential).await;
            let _ = internal.send(SessionInternal::ReconnectDone(result));
        });
    }

    fn handle_internal(&mut self, message: SessionInternal) {
        match message {
            SessionInternal::ConnectDone(Ok(())) => {
                if let Some(error) = self.take_transition_loss() {
                    warn!(error = %error, "Connection lost while subscribing");
                    self.connection_lost(error);
                    self.replay_deferred();
                    return;
                }
                info!("Connected and subscribed to provisioning responses");
                self.transition(ConnectionState::Connected);
                self.replay_deferred();
            }
            SessionInternal::ConnectDone(Err(e)) => {
                self.lost_during_transition = None;
                warn!(error = %e, "Could not connect to the provisioning service");
                self.transition(ConnectionState::Disconnected);
                // Every outstanding operation was waiting on this attempt.
                self.purge(e);
                self.replay_deferred();
            }
            SessionInternal::PublishDone { request_id, result } => {
                let Err(e) = result else {
                    return;
                };
                let Some(operation) = self.pending.remove(&request_id) else {
                    return;
                };
                warn!(%request_id, error = %e, "Provisioning request could not be published");
                // The connection-loss event may still be queued behind this completion;
                // fail the operation the same way that event would.
                let error = if self.state == ConnectionState::Connected
                    && (e.is_not_connected()
                        || self.manager.state() != ConnectionState::Connected)
                {
                    connection_lost_error(&e)
                } else {
                    e
                };
                let _ = operation.respond.send(Err(error));
            }
            SessionInternal::DisconnectDone(result) => {
                if let Err(e) = &result {
                    warn!(error = %e, "Disconnect did not complete cleanly");
                }
                self.transition(ConnectionState::Disconnected);
                if let Some(waiter) = self.waiter.take() {
                    let _ = waiter.send(result);
                }
                self.replay_deferred();
            }
            SessionInternal::ReconnectDone(result) => {
                let result = match result {
                    Ok(()) => match self.take_transition_loss() {
                        Some(error) => {
                            warn!(error = %error, "Connection lost while resubscribing");
                            self.connection_lost(error.clone());
                            Err(error)
                        }
                        None => {
                            self.transition(ConnectionState::Connected);
                            Ok(())
                        }
                    },
                    Err(e) => {
                        self.lost_during_transition = None;
                        warn!(error = %e, "Reconnect with the new credential failed");
                        self.transition(ConnectionState::Disconnected);
                        self.purge(e.clone());
                        Err(e)
                    }
                };
                if let Some(waiter) = self.waiter.take() {
                    let _ = waiter.send(result);
                }
                self.replay_deferred();
            }
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { topic, payload } => self.dispatch_response(&topic, &payload),
            ConnectionEvent::Disconnected(error) => match self.state {
                ConnectionState::Connected => {
                    warn!(error = %error, "Connection to the provisioning service lost");
                    self.connection_lost(error);
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    debug!(error = %error, state = %self.state, "Connection lost during a transition");
                    self.lost_during_transition = Some(error);
                }
                _ => {
                    debug!(error = %error, state = %self.state, "Ignoring connection loss");
                }
            },
            ConnectionEvent::StateChanged(state) => {
                debug!(connection_state = %state, "Connection state changed");
            }
        }
    }

    fn dispatch_response(&mut self, topic: &str, payload: &[u8]) {
        let response = match topics::parse_response_topic(topic) {
            Ok(response) => response,
            Err(e) => {
                debug!(%topic, error = %e, "Dropping message that is not a provisioning response");
                metrics().response_dropped();
                return;
            }
        };

        let operation = Uuid::parse_str(&response.request_id)
            .ok()
            .and_then(|request_id| self.pending.remove(&request_id));
        let Some(operation) = operation else {
            debug!(request_id = %response.request_id, status = response.status, "No pending operation for response");
            metrics().response_dropped();
            return;
        };

        let result = interpret_response(
            &operation.kind,
            response.status,
            response.retry_after,
            payload,
            self.settings.polling_interval,
        );
        let outcome = match &result {
            Ok(r) => r.result.status.to_string(),
            Err(e) => e.to_string(),
        };
        info!(
            request_id = %response.request_id,
            status = response.status,
            elapsed_ms = operation.issued_at.elapsed().as_millis() as u64,
            %outcome,
            "Provisioning response"
        );
        metrics().response_dispatched();
        let _ = operation.respond.send(result);
    }

    fn purge(&mut self, error: TransportError) {
        if self.pending.is_empty() {
            return;
        }
        info!(count = self.pending.len(), error = %error, "Failing outstanding provisioning operations");
        metrics().operations_cancelled(self.pending.len());
        for (_, operation) in self.pending.drain() {
            let _ = operation.respond.send(Err(error.clone()));
        }
    }

    /// A loss recorded during the transition, or a manager that is no longer connected
    fn take_transition_loss(&mut self) -> Option<TransportError> {
        self.lost_during_transition.take().or_else(|| {
            (self.manager.state() != ConnectionState::Connected)
                .then(|| TransportError::not_connected("connection lost during setup"))
        })
    }

    fn connection_lost(&mut self, error: TransportError) {
        self.transition(ConnectionState::Disconnected);
        self.purge(connection_lost_error(&error));
        let _ = self.events.send(ProvisioningEvent::Error(error));
    }

    fn replay_deferred(&mut self) {
        let queued = std::mem::take(&mut self.deferred);
        for work in queued {
            self.dispatch(work);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "Session state changed");
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events.send(ProvisioningEvent::StateChanged(next));
    }

    async fn shutdown(&mut self) {
        self.purge(session_closed());
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(session_closed()));
        }
        for work in self.deferred.drain(..) {
            match work {
                Deferred::Disconnect(respond) | Deferred::UpdateCredential(_, respond) => {
                    let _ = respond.send(Err(session_closed()));
                }
                Deferred::Publish(_) => {}
            }
        }
        if let Err(e) = self.manager.disconnect().await {
            debug!(error = %e, "Disconnect on shutdown failed");
        }
    }
}

/// Connect, then subscribe to responses. A failed subscribe closes the connection again.
async fn connect_and_subscribe(
    manager: &ConnectionManager,
    config: ConnectionConfig,
) -> TransportResult<()> {
    manager.connect(config).await?;
    subscribe_or_disconnect(manager).await
}

async fn reconnect_and_subscribe(
    manager: &ConnectionManager,
    credential: Credential,
) -> TransportResult<()> {
    manager.update_credential(credential).await?;
    subscribe_or_disconnect(manager).await
}

async fn subscribe_or_disconnect(manager: &ConnectionManager) -> TransportResult<()> {
    if let Err(e) = manager.subscribe(RESPONSE_SUBSCRIPTION, QoS::AtLeastOnce).await {
        if let Err(disconnect_error) = manager.disconnect().await {
            debug!(error = %disconnect_error, "Disconnect after failed subscribe failed");
        }
        return Err(e);
    }
    Ok(())
}
