//! Device provisioning over MQTT
//!
//! - [`topics`] - Request topic construction and response topic parsing
//! - [`messages`] - Request and response bodies, status classification
//! - [`session`] - The [`ProvisioningSession`] request/response state machine
//! - [`polling`] - [`RegistrationClient`], registration with status polling

pub mod messages;
pub mod polling;
pub mod session;
pub mod topics;

pub use messages::{
    OperationKind, RegistrationRequest, RegistrationResponse, RegistrationResult,
    RegistrationState, RegistrationStatus, DEFAULT_POLLING_INTERVAL,
};
pub use polling::{RegistrationClient, RegistrationError};
pub use session::{
    ProvisioningEvent, ProvisioningEvents, ProvisioningSession, ProvisioningSettings,
    DEFAULT_GLOBAL_ENDPOINT,
};
