//! Testing utilities
//!
//! An in-memory MQTT connector so the connection manager and the provisioning
//! session can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
