//! Provisioning request and response bodies, and response classification

use crate::error::{translate_status, TransportError, TransportResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Polling interval used when the service sends no `retry-after`
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(2000);

/// What the caller asks the service for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub registration_id: String,
    /// Custom data forwarded to the allocation policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl RegistrationRequest {
    pub fn new<S: Into<String>>(registration_id: S) -> Self {
        Self {
            registration_id: registration_id.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    registration_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
}

fn encode(body: &RequestBody<'_>) -> TransportResult<Bytes> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(|e| TransportError::Format(format!("cannot encode request body: {e}")))
}

/// `{"registrationId":"<id>"[,"payload":<any>]}`
pub fn registration_body(request: &RegistrationRequest) -> TransportResult<Bytes> {
    encode(&RequestBody {
        registration_id: &request.registration_id,
        payload: request.payload.as_ref(),
    })
}

/// `{"registrationId":"<id>"}`
pub fn operation_status_body(request: &RegistrationRequest) -> TransportResult<Bytes> {
    encode(&RequestBody {
        registration_id: &request.registration_id,
        payload: None,
    })
}

/// Registration status reported by the service.
///
/// `Registering` is never sent by the service; it marks a throttled registration
/// that the caller should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
    Registering,
}

impl RegistrationStatus {
    /// The registration is still in progress and should be polled again
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            RegistrationStatus::Unassigned
                | RegistrationStatus::Assigning
                | RegistrationStatus::Registering
        )
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationStatus::Unassigned => "unassigned",
            RegistrationStatus::Assigning => "assigning",
            RegistrationStatus::Assigned => "assigned",
            RegistrationStatus::Failed => "failed",
            RegistrationStatus::Disabled => "disabled",
            RegistrationStatus::Registering => "registering",
        };
        f.write_str(name)
    }
}

/// Device registration record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_hub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RegistrationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substatus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_date_time_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Body of a successful response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub status: RegistrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_state: Option<RegistrationState>,
}

/// A classified response, with the interval to wait before polling again
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResponse {
    pub result: RegistrationResult,
    pub polling_interval: Duration,
}

/// Which request a response belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Registration,
    OperationStatusQuery { operation_id: String },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Registration => "registration",
            OperationKind::OperationStatusQuery { .. } => "operation_status_query",
        }
    }
}

/// Error body the service sends with failed requests
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceErrorBody {
    #[serde(default)]
    error_code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

fn failure_message(status: u16, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match serde_json::from_slice::<ServiceErrorBody>(body) {
        Ok(ServiceErrorBody {
            error_code: Some(code),
            message: Some(message),
        }) => format!("{message} (errorCode {code})"),
        Ok(ServiceErrorBody {
            message: Some(message),
            ..
        }) => message,
        _ if !text.trim().is_empty() => text.into_owned(),
        _ => format!("request failed with status {status}"),
    }
}

/// `retry-after` seconds in milliseconds, or the default
pub fn polling_interval(retry_after: Option<u64>, default: Duration) -> Duration {
    retry_after
        .map(|seconds| Duration::from_millis(seconds.saturating_mul(1000)))
        .unwrap_or(default)
}

/// Classify a response by status code.
///
/// Below 300 the body is the result. From 300 up to 428 the request failed. From
/// 429 on the service is busy and the caller should poll again, so a synthetic
/// pending result is returned.
pub fn interpret_response(
    kind: &OperationKind,
    status: u16,
    retry_after: Option<u64>,
    body: &[u8],
    default_interval: Duration,
) -> TransportResult<RegistrationResponse> {
    let polling_interval = polling_interval(retry_after, default_interval);

    let result = if status < 300 {
        serde_json::from_slice::<RegistrationResult>(body).map_err(|e| {
            TransportError::Format(format!("invalid registration response body: {e}"))
        })?
    } else if status < 429 {
        return Err(translate_status(status, failure_message(status, body)));
    } else {
        match kind {
            OperationKind::Registration => RegistrationResult {
                operation_id: None,
                status: RegistrationStatus::Registering,
                registration_state: None,
            },
            OperationKind::OperationStatusQuery { operation_id } => RegistrationResult {
                operation_id: Some(operation_id.clone()),
                status: RegistrationStatus::Assigning,
                registration_state: None,
            },
        }
    };

    Ok(RegistrationResponse {
        result,
        polling_interval,
    })
}
