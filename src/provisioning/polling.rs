//! Register-and-poll loop
//!
//! [`RegistrationClient`] drives a full device registration: it sends the
//! registration request, then polls the operation status at the interval the
//! service asks for until the registration settles.

use super::messages::{RegistrationRequest, RegistrationResponse, RegistrationState, RegistrationStatus};
use super::session::ProvisioningSession;
use crate::error::TransportError;
use crate::observability::metrics;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Why a registration did not produce an assignment
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("registration {status}: {message}")]
    Rejected {
        status: RegistrationStatus,
        error_code: Option<i64>,
        message: String,
    },

    #[error("service reported {0} without a registration state")]
    MissingRegistrationState(RegistrationStatus),

    #[error("registration did not complete within {0:?}")]
    TimedOut(Duration),
}

/// Runs registrations over a [`ProvisioningSession`]
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    session: ProvisioningSession,
    timeout: Option<Duration>,
}

impl RegistrationClient {
    pub fn new(session: ProvisioningSession) -> Self {
        Self {
            session,
            timeout: None,
        }
    }

    /// Give up (and cancel the outstanding request) after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn session(&self) -> &ProvisioningSession {
        &self.session
    }

    /// Register the device and wait for the outcome. The session is disconnected
    /// afterwards whatever the result.
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationState, RegistrationError> {
        let started = Instant::now();
        let span = crate::registration_span!(registration_id = %request.registration_id);

        let outcome = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, self.poll(&request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(timeout = ?limit, "Registration timed out");
                        if let Err(e) = self.session.cancel().await {
                            debug!(error = %e, "Cancel after timeout failed");
                        }
                        Err(RegistrationError::TimedOut(limit))
                    }
                },
                None => self.poll(&request).await,
            }
        }
        .instrument(span)
        .await;

        if let Err(e) = self.session.disconnect().await {
            debug!(error = %e, "Disconnect after registration failed");
        }
        metrics().registration_finished(started.elapsed(), outcome.is_ok());
        outcome
    }

    async fn poll(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationState, RegistrationError> {
        let mut response = self.session.registration_request(request.clone()).await?;

        loop {
            let status = response.result.status;
            debug!(%status, operation_id = ?response.result.operation_id, "Registration status");

            if !status.is_pending() {
                return settle(response);
            }

            tokio::time::sleep(response.polling_interval).await;
            response = match response.result.operation_id.as_deref() {
                Some(operation_id) => {
                    self.session
                        .query_operation_status(request.clone(), operation_id)
                        .await?
                }
                // Throttled before an operation existed: register again.
                None => self.session.registration_request(request.clone()).await?,
            };
        }
    }
}

fn settle(response: RegistrationResponse) -> Result<RegistrationState, RegistrationError> {
    let status = response.result.status;
    let state = response
        .result
        .registration_state
        .ok_or(RegistrationError::MissingRegistrationState(status))?;

    if status == RegistrationStatus::Assigned {
        info!(
            assigned_hub = state.assigned_hub.as_deref().unwrap_or_default(),
            device_id = state.device_id.as_deref().unwrap_or_default(),
            "Device assigned"
        );
        return Ok(state);
    }

    let message = state
        .error_message
        .clone()
        .unwrap_or_else(|| format!("registration ended with status {status}"));
    warn!(%status, error_code = ?state.error_code, %message, "Registration rejected");
    Err(RegistrationError::Rejected {
        status,
        error_code: state.error_code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::messages::RegistrationResult;

    fn response(status: RegistrationStatus, state: Option<RegistrationState>) -> RegistrationResponse {
        RegistrationResponse {
            result: RegistrationResult {
                operation_id: Some("op".to_string()),
                status,
                registration_state: state,
            },
            polling_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_assigned_settles_ok() {
        let state = RegistrationState {
            assigned_hub: Some("hub.example.net".to_string()),
            device_id: Some("device-1".to_string()),
            status: Some(RegistrationStatus::Assigned),
            ..RegistrationState::default()
        };
        let settled = settle(response(RegistrationStatus::Assigned, Some(state.clone()))).unwrap();
        assert_eq!(settled, state);
    }

    #[test]
    fn test_failed_settles_rejected() {
        let state = RegistrationState {
            error_code: Some(400207),
            error_message: Some("Custom allocation failed".to_string()),
            ..RegistrationState::default()
        };
        match settle(response(RegistrationStatus::Failed, Some(state))) {
            Err(RegistrationError::Rejected {
                status,
                error_code,
                message,
            }) => {
                assert_eq!(status, RegistrationStatus::Failed);
                assert_eq!(error_code, Some(400207));
                assert_eq!(message, "Custom allocation failed");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_disabled_without_state() {
        assert!(matches!(
            settle(response(RegistrationStatus::Disabled, None)),
            Err(RegistrationError::MissingRegistrationState(RegistrationStatus::Disabled))
        ));
    }
}
