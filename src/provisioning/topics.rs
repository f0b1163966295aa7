//! Provisioning topic construction and response topic parsing
//!
//! Requests carry a correlation id in the `$rid` query parameter of the topic they
//! are published on. Responses arrive on
//! `$dps/registrations/res/<status>/?$rid=<rid>[&retry-after=<seconds>][&...]`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;
use url::form_urlencoded;
use uuid::Uuid;

/// Filter covering every provisioning response
pub const RESPONSE_SUBSCRIPTION: &str = "$dps/registrations/res/#";

/// Service API version sent in the MQTT username
pub const API_VERSION: &str = "2019-03-31";

const MAX_REGISTRATION_ID_LEN: usize = 128;

static RESPONSE_TOPIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$dps/registrations/res/([^/]+)/\?(.*)$").expect("static regex is valid")
});

/// Topic a registration request is published on
pub fn registration_topic(request_id: &Uuid) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
}

/// Topic an operation status query is published on
pub fn operation_status_topic(request_id: &Uuid, operation_id: &str) -> String {
    let operation_id: String = form_urlencoded::byte_serialize(operation_id.as_bytes()).collect();
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={operation_id}"
    )
}

/// MQTT username for a device registration
pub fn username(id_scope: &str, registration_id: &str, client_version: &str) -> String {
    let client_version: String =
        form_urlencoded::byte_serialize(client_version.as_bytes()).collect();
    format!(
        "{id_scope}/registrations/{registration_id}/api-version={API_VERSION}&ClientVersion={client_version}"
    )
}

/// A parsed response topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTopic {
    pub status: u16,
    pub request_id: String,
    /// `retry-after` in seconds, when present and numeric
    pub retry_after: Option<u64>,
    /// Every query parameter, URL-decoded
    pub query: HashMap<String, String>,
}

/// Why an inbound topic could not be dispatched
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("not a provisioning response topic: {0}")]
    NotAResponse(String),
    #[error("invalid status code: {0}")]
    InvalidStatus(String),
    #[error("response topic has no $rid: {0}")]
    MissingRequestId(String),
}

/// Parse `$dps/registrations/res/<status>/?<query>`. Query parameter order does not matter.
pub fn parse_response_topic(topic: &str) -> Result<ResponseTopic, TopicError> {
    let captures = RESPONSE_TOPIC
        .captures(topic)
        .ok_or_else(|| TopicError::NotAResponse(topic.to_string()))?;

    let status_text = &captures[1];
    let status = status_text
        .parse::<u16>()
        .map_err(|_| TopicError::InvalidStatus(status_text.to_string()))?;

    let query: HashMap<String, String> = form_urlencoded::parse(captures[2].as_bytes())
        .into_owned()
        .collect();

    let request_id = query
        .get("$rid")
        .filter(|rid| !rid.is_empty())
        .cloned()
        .ok_or_else(|| TopicError::MissingRequestId(topic.to_string()))?;
    let retry_after = query
        .get("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok());

    Ok(ResponseTopic {
        status,
        request_id,
        retry_after,
        query,
    })
}

/// The `$rid` of any topic carrying one in its query string
pub fn request_id_from_topic(topic: &str) -> Option<String> {
    let (_, query) = topic.split_once('?')?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "$rid")
        .map(|(_, value)| value.into_owned())
}

/// Registration id validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{0} is longer than {1} characters")]
    TooLong(&'static str, usize),
    #[error("{0} contains invalid character: '{1}'")]
    InvalidChar(&'static str, char),
}

/// Registration ids are lowercase alphanumerics plus `-`, `.`, `_` and `:`
pub fn validate_registration_id(registration_id: &str) -> Result<(), IdentifierError> {
    const NAME: &str = "registration id";
    if registration_id.is_empty() {
        return Err(IdentifierError::Empty(NAME));
    }
    if registration_id.len() > MAX_REGISTRATION_ID_LEN {
        return Err(IdentifierError::TooLong(NAME, MAX_REGISTRATION_ID_LEN));
    }
    for ch in registration_id.chars() {
        let allowed = ch.is_ascii_lowercase() || ch.is_ascii_digit() || "-._:".contains(ch);
        if !allowed {
            return Err(IdentifierError::InvalidChar(NAME, ch));
        }
    }
    Ok(())
}

/// Id scopes are alphanumeric, for example `0ne00000A0A`
pub fn validate_id_scope(id_scope: &str) -> Result<(), IdentifierError> {
    const NAME: &str = "id scope";
    if id_scope.is_empty() {
        return Err(IdentifierError::Empty(NAME));
    }
    match id_scope.chars().find(|ch| !ch.is_ascii_alphanumeric()) {
        Some(ch) => Err(IdentifierError::InvalidChar(NAME, ch)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_topics() {
        let rid = Uuid::from_u128(1);
        assert_eq!(
            registration_topic(&rid),
            "$dps/registrations/PUT/iotdps-register/?$rid=00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(
            operation_status_topic(&rid, "4.abc.def"),
            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid=00000000-0000-0000-0000-000000000001&operationId=4.abc.def"
        );
    }

    #[test]
    fn test_username() {
        assert_eq!(
            username("0ne0001", "device-1", "dps-mqtt/0.1.0 (linux)"),
            "0ne0001/registrations/device-1/api-version=2019-03-31&ClientVersion=dps-mqtt%2F0.1.0+%28linux%29"
        );
    }

    #[test]
    fn test_parse_response_topic() {
        let parsed =
            parse_response_topic("$dps/registrations/res/202/?$rid=abc&retry-after=5").unwrap();
        assert_eq!(parsed.status, 202);
        assert_eq!(parsed.request_id, "abc");
        assert_eq!(parsed.retry_after, Some(5));
    }

    #[test]
    fn test_query_order_does_not_matter() {
        let parsed =
            parse_response_topic("$dps/registrations/res/429/?retry-after=3&$rid=xyz").unwrap();
        assert_eq!(parsed.request_id, "xyz");
        assert_eq!(parsed.retry_after, Some(3));
    }

    #[test]
    fn test_query_is_url_decoded() {
        let parsed =
            parse_response_topic("$dps/registrations/res/200/?$rid=a%2Fb&note=hello%20world")
                .unwrap();
        assert_eq!(parsed.request_id, "a/b");
        assert_eq!(parsed.query.get("note").map(String::as_str), Some("hello world"));
    }

    #[test]
    fn test_parse_response_topic_errors() {
        assert!(matches!(
            parse_response_topic("devices/x/messages"),
            Err(TopicError::NotAResponse(_))
        ));
        assert!(matches!(
            parse_response_topic("$dps/registrations/res/abc/?$rid=1"),
            Err(TopicError::InvalidStatus(_))
        ));
        assert!(matches!(
            parse_response_topic("$dps/registrations/res/200/?retry-after=1"),
            Err(TopicError::MissingRequestId(_))
        ));
    }

    #[test]
    fn test_non_numeric_retry_after_is_ignored() {
        let parsed =
            parse_response_topic("$dps/registrations/res/202/?$rid=1&retry-after=soon").unwrap();
        assert_eq!(parsed.retry_after, None);
    }

    #[test]
    fn test_request_id_from_topic() {
        assert_eq!(
            request_id_from_topic(&registration_topic(&Uuid::from_u128(7))),
            Some("00000000-0000-0000-0000-000000000007".to_string())
        );
        assert_eq!(request_id_from_topic("no/query"), None);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_registration_id("device-01.test_a:b").is_ok());
        assert_eq!(
            validate_registration_id(""),
            Err(IdentifierError::Empty("registration id"))
        );
        assert_eq!(
            validate_registration_id("Device"),
            Err(IdentifierError::InvalidChar("registration id", 'D'))
        );
        assert!(validate_registration_id(&"a".repeat(129)).is_err());

        assert!(validate_id_scope("0ne00000A0A").is_ok());
        assert!(validate_id_scope("0ne/x").is_err());
        assert!(validate_id_scope("").is_err());
    }

    proptest! {
        #[test]
        fn response_topic_roundtrips_status_and_rid(
            status in 100u16..=599,
            rid in "[a-zA-Z0-9-]{1,40}",
            retry in proptest::option::of(0u64..100_000),
            rid_first in any::<bool>(),
        ) {
            let mut params = vec![format!("$rid={rid}")];
            if let Some(retry) = retry {
                let param = format!("retry-after={retry}");
                if rid_first { params.push(param) } else { params.insert(0, param) }
            }
            let topic = format!("$dps/registrations/res/{status}/?{}", params.join("&"));

            let parsed = parse_response_topic(&topic).unwrap();
            prop_assert_eq!(parsed.status, status);
            prop_assert_eq!(parsed.request_id, rid);
            prop_assert_eq!(parsed.retry_after, retry);
        }

        #[test]
        fn parsing_arbitrary_topics_never_panics(topic in ".*") {
            let _ = parse_response_topic(&topic);
            let _ = request_id_from_topic(&topic);
        }

        #[test]
        fn valid_registration_ids_pass(id in "[a-z0-9._:-]{1,128}") {
            prop_assert!(validate_registration_id(&id).is_ok());
        }
    }
}
