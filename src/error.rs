//! Transport error taxonomy and classification
//!
//! Raw failures reported by the underlying MQTT client ([`LinkError`]) and status
//! codes returned by the provisioning service are translated here into the typed
//! [`TransportError`] that every public operation of this crate returns.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Raw error surfaced by the underlying MQTT client.
///
/// `code` carries a socket-level error code when the failure came from the network
/// stack (for example `ConnectionReset`); broker and protocol failures only have a
/// message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct LinkError {
    pub code: Option<String>,
    pub message: String,
}

impl LinkError {
    /// Create an error with only a message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Create an error originating from the socket layer
    pub fn socket<C: Into<String>, S: Into<String>>(code: C, message: S) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Typed transport errors returned by the connection manager and provisioning session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal server error: {0}")]
    InternalServer(String),

    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Service returned status {status}: {message}")]
    Service { status: u16, message: String },

    #[error(transparent)]
    Generic(#[from] LinkError),
}

impl TransportError {
    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        Self::NotConnected(message.into())
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::OperationCancelled(message.into())
    }

    pub fn argument<S: Into<String>>(message: S) -> Self {
        Self::Argument(message.into())
    }

    /// True for errors caused by losing (or never having) a connection
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected(_))
    }
}

type Constructor = fn(String) -> TransportError;

/// Message fragments recognised in raw MQTT client errors, checked in order
const MESSAGE_RULES: &[(&str, Constructor)] = &[
    ("premature close", TransportError::NotConnected),
    ("client disconnecting", TransportError::NotConnected),
    ("No connection to broker", TransportError::NotConnected),
    ("Invalid topic", TransportError::Format),
    ("Unacceptable protocol version", TransportError::NotImplemented),
    ("Identifier rejected", TransportError::Unauthorized),
    ("Bad username or password", TransportError::Unauthorized),
    ("Not authorized", TransportError::Unauthorized),
    ("Server unavailable", TransportError::ServiceUnavailable),
    ("unrecognized packet type", TransportError::InternalServer),
];

/// Classify a raw MQTT client error.
///
/// A socket code always means the connection is gone. Otherwise the first message
/// rule that matches wins; unmatched errors pass through unchanged as
/// [`TransportError::Generic`].
pub fn translate_link_error(error: LinkError) -> TransportError {
    if error.code.is_some() {
        return TransportError::NotConnected(error.message);
    }

    match MESSAGE_RULES
        .iter()
        .find(|(fragment, _)| error.message.contains(fragment))
    {
        Some((_, constructor)) => constructor(error.message),
        None => TransportError::Generic(error),
    }
}

/// Translate a failed provisioning service status (300..429) into a typed error
pub fn translate_status(status: u16, message: String) -> TransportError {
    match status {
        400 => TransportError::Argument(message),
        401 | 403 => TransportError::Unauthorized(message),
        404 => TransportError::DeviceNotFound(message),
        _ => TransportError::Service { status, message },
    }
}

static SIGNATURE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sig|signature|skn|password|key)=[^&\s]+").expect("static regex is valid")
});

/// Strip shared access signature material out of a message before it is logged
pub fn redact_secrets(message: &str) -> String {
    SIGNATURE_PATTERN
        .replace_all(message, "${1}=***")
        .into_owned()
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_code_always_means_not_connected() {
        let error = LinkError::socket("ECONNRESET", "Bad username or password");
        assert!(matches!(
            translate_link_error(error),
            TransportError::NotConnected(_)
        ));
    }

    #[test]
    fn test_message_rules() {
        let cases: Vec<(&str, fn(&TransportError) -> bool)> = vec![
            ("premature close", |e| matches!(e, TransportError::NotConnected(_))),
            ("client disconnecting", |e| {
                matches!(e, TransportError::NotConnected(_))
            }),
            ("No connection to broker", |e| {
                matches!(e, TransportError::NotConnected(_))
            }),
            ("Invalid topic $dps/#/x", |e| matches!(e, TransportError::Format(_))),
            ("Connection refused: Unacceptable protocol version", |e| {
                matches!(e, TransportError::NotImplemented(_))
            }),
            ("Connection refused: Identifier rejected", |e| {
                matches!(e, TransportError::Unauthorized(_))
            }),
            ("Connection refused: Bad username or password", |e| {
                matches!(e, TransportError::Unauthorized(_))
            }),
            ("Connection refused: Not authorized", |e| {
                matches!(e, TransportError::Unauthorized(_))
            }),
            ("Connection refused: Server unavailable", |e| {
                matches!(e, TransportError::ServiceUnavailable(_))
            }),
            ("unrecognized packet type 15", |e| {
                matches!(e, TransportError::InternalServer(_))
            }),
        ];

        for (message, check) in cases {
            let translated = translate_link_error(LinkError::new(message));
            assert!(check(&translated), "unexpected translation for {message}: {translated:?}");
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let error = LinkError::new("premature close while Not authorized");
        assert!(matches!(
            translate_link_error(error),
            TransportError::NotConnected(_)
        ));
    }

    #[test]
    fn test_unmatched_error_passes_through() {
        let original = LinkError::new("something odd happened");
        let translated = translate_link_error(original.clone());
        assert_eq!(translated, TransportError::Generic(original));
        assert_eq!(translated.to_string(), "something odd happened");
    }

    #[test]
    fn test_rules_are_case_sensitive() {
        let translated = translate_link_error(LinkError::new("invalid TOPIC"));
        assert!(matches!(translated, TransportError::Generic(_)));
    }

    #[test]
    fn test_translate_status() {
        assert!(matches!(
            translate_status(400, "bad".into()),
            TransportError::Argument(_)
        ));
        assert!(matches!(
            translate_status(401, "nope".into()),
            TransportError::Unauthorized(_)
        ));
        assert!(matches!(
            translate_status(403, "nope".into()),
            TransportError::Unauthorized(_)
        ));
        assert!(matches!(
            translate_status(404, "missing".into()),
            TransportError::DeviceNotFound(_)
        ));
        assert_eq!(
            translate_status(412, "etag".into()),
            TransportError::Service {
                status: 412,
                message: "etag".into()
            }
        );
    }

    #[test]
    fn test_redact_secrets() {
        let message = "SharedAccessSignature sr=scope%2Fregistrations%2Fd1&sig=abc123%3D&se=1700000000&skn=registration";
        let redacted = redact_secrets(message);
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("sig=***"));
        assert!(redacted.contains("skn=***"));
        assert!(redacted.contains("se=1700000000"));
    }

    #[test]
    fn test_redact_leaves_plain_messages_alone() {
        assert_eq!(redact_secrets("connection refused"), "connection refused");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::not_connected("closed").to_string(),
            "Not connected: closed"
        );
        assert_eq!(
            TransportError::cancelled("gone").to_string(),
            "Operation cancelled: gone"
        );
        assert!(TransportError::not_connected("x").is_not_connected());
        assert!(!TransportError::argument("x").is_not_connected());
    }
}
