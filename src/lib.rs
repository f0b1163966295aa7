//! DPS over MQTT - Rust Implementation
//!
//! An MQTT connection lifecycle manager and a device provisioning request/response
//! engine built on top of it.
//!
//! # Overview
//!
//! - [`transport::mqtt::ConnectionManager`] serialises connect, disconnect, publish,
//!   subscribe and credential rotation over a single MQTT connection. Every publish
//!   is tracked until acknowledged and fails exactly once if the connection drops.
//! - [`provisioning::ProvisioningSession`] correlates provisioning requests with
//!   their responses through a `$rid` topic parameter, connecting on demand.
//! - [`provisioning::RegistrationClient`] registers a device and polls the
//!   operation status until it settles.
//! - [`error`] maps MQTT failures and service status codes onto one error taxonomy.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dps_mqtt::provisioning::{
//!     ProvisioningSession, ProvisioningSettings, RegistrationClient, RegistrationRequest,
//! };
//! use dps_mqtt::transport::mqtt::{Credential, RumqttcConnector};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let settings = ProvisioningSettings::new(
//!     "0ne00000A0A",
//!     Credential::SharedAccessSignature("SharedAccessSignature sr=...".to_string()),
//! );
//! let (session, _events) = ProvisioningSession::new(Arc::new(RumqttcConnector::default()), settings);
//!
//! let state = RegistrationClient::new(session)
//!     .register(RegistrationRequest::new("my-device"))
//!     .await?;
//! println!("assigned to {:?}", state.assigned_hub);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod correlation;
pub mod error;
pub mod observability;
pub mod provisioning;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use error::{LinkError, TransportError, TransportResult};
pub use provisioning::{
    ProvisioningSession, ProvisioningSettings, RegistrationClient, RegistrationRequest,
    RegistrationState, RegistrationStatus,
};
pub use transport::mqtt::{ConnectionManager, ConnectionState, Credential, RumqttcConnector};
