//! MQTT connection management
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection configuration, state and option building
//! - [`message_handler`] - Pure routing of `rumqttc` events and acknowledgement tracking
//! - [`client`] - `rumqttc`-backed [`MqttConnector`](crate::transport::MqttConnector)
//! - [`manager`] - The [`ConnectionManager`] state machine
//!
//! # Usage
//!
//! ```rust,no_run
//! use dps_mqtt::transport::mqtt::{ConnectionConfig, ConnectionManager, Credential, RumqttcConnector};
//! use dps_mqtt::transport::PublishOptions;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let (manager, _events) = ConnectionManager::new(Arc::new(RumqttcConnector::default()));
//! let config = ConnectionConfig::new(
//!     "mqtts://global.azure-devices-provisioning.net:8883",
//!     "my-device",
//!     "0ne00000000/registrations/my-device/api-version=2019-03-31",
//!     Credential::SharedAccessSignature("SharedAccessSignature sr=...".to_string()),
//! );
//! manager.connect(config).await?;
//! manager.publish("some/topic", b"hello".to_vec(), PublishOptions::default()).await?;
//! manager.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod manager;
pub mod message_handler;

pub use client::RumqttcConnector;
pub use connection::{
    ClientCertificate, ConnectionConfig, ConnectionState, Credential, DEFAULT_KEEP_ALIVE,
    RECONNECT_DISCONNECT_TIMEOUT,
};
pub use manager::{ConnectionEvent, ConnectionEvents, ConnectionManager, ManagerSettings};
pub use message_handler::{AckTracker, EventRoute, MessageHandler};
