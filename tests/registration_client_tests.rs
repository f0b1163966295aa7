//! Integration tests for the register-and-poll loop


use dps_mqtt::error::{LinkError, TransportError};
use dps_mqtt::provisioning::{
    RegistrationClient, RegistrationError, RegistrationRequest, RegistrationStatus,
};
use std::time::Duration;
use test_helpers::test_session;

const ASSIGNING: &str = r#"{"operationId":"4.abc.def","status":"assigning"}"#;

const ASSIGNED: &str = r#"{
    "operationId": "4.abc.def",
    "status": "assigned",
    "registrationState": {
        "registrationId": "device-1",
        "createdDateTimeUtc": "2024-05-01T10:00:00.1234567Z",
        "assignedHub": "hub-1.azure-devices.net",
        "deviceId": "device-1",
        "status": "assigned",
        "substatus": "initialAssignment",
        "lastUpdatedDateTimeUtc": "2024-05-01T10:00:01.5Z",
        "etag": "IjA0MDA0ZjQ2LTAwMDAtMDcwMC0wMDAwLTY1YjE0ZDhhMDAwMCI="
    }
}"#;

#[tokio::test(start_paused = true)]
async fn test_register_polls_until_assigned() {
    let (broker, session, _events) = test_session();
    let client = RegistrationClient::new(session);

    let registration = tokio::spawn({
        let client = client.clone();
        async move { client.register(RegistrationRequest::new("device-1")).await }
    });

    let register = broker.next_publish().await;
    assert!(register.topic.starts_with("$dps/registrations/PUT/iotdps-register/"));
    let started = tokio::time::Instant::now();
    broker.reply(&register, 202, "&retry-after=3", ASSIGNING);

    let query = broker.next_publish().await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(query
        .topic
        .starts_with("$dps/registrations/GET/iotdps-get-operationstatus/"));
    assert!(query.topic.ends_with("&operationId=4.abc.def"));
    broker.reply(&query, 200, "", ASSIGNED);

    let state = registration.await.unwrap().unwrap();
    assert_eq!(state.assigned_hub.as_deref(), Some("hub-1.azure-devices.net"));
    assert_eq!(state.device_id.as_deref(), Some("device-1"));
    assert_eq!(state.substatus.as_deref(), Some("initialAssignment"));

    assert_eq!(broker.disconnect_count(), 1);
    assert!(!broker.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_throttled_registration_is_sent_again() {
    let (broker, session, _events) = test_session();
    let client = RegistrationClient::new(session);

    let registration = tokio::spawn({
        let client = client.clone();
        async move { client.register(RegistrationRequest::new("device-1")).await }
    });

    let first = broker.next_publish().await;
    broker.reply(&first, 429, "&retry-after=1", "");

    let second = broker.next_publish().await;
    assert!(second.topic.starts_with("$dps/registrations/PUT/iotdps-register/"));
    assert_ne!(first.request_id(), second.request_id());
    broker.reply(&second, 200, "", ASSIGNED);

    assert!(registration.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_failed_registration_is_rejected() {
    let (broker, session, _events) = test_session();
    let client = RegistrationClient::new(session);

    let registration = tokio::spawn({
        let client = client.clone();
        async move { client.register(RegistrationRequest::new("device-1")).await }
    });

    let register = broker.next_publish().await;
    broker.reply(
        &register,
        200,
        "",
        r#"{
            "operationId": "4.abc.def",
            "status": "failed",
            "registrationState": {
                "registrationId": "device-1",
                "status": "failed",
                "errorCode": 400207,
                "errorMessage": "Custom allocation failed with status code: 400"
            }
        }"#,
    );

    match registration.await.unwrap() {
        Err(RegistrationError::Rejected {
            status,
            error_code,
            message,
        }) => {
            assert_eq!(status, RegistrationStatus::Failed);
            assert_eq!(error_code, Some(400207));
            assert!(message.starts_with("Custom allocation failed"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!broker.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_registration_times_out() {
    let (broker, session, _events) = test_session();
    let client = RegistrationClient::new(session).with_timeout(Duration::from_secs(10));

    let registration = tokio::spawn({
        let client = client.clone();
        async move { client.register(RegistrationRequest::new("device-1")).await }
    });
    broker.next_publish().await;

    assert!(matches!(
        registration.await.unwrap(),
        Err(RegistrationError::TimedOut(limit)) if limit == Duration::from_secs(10)
    ));
    assert!(!broker.is_connected());
}

#[tokio::test]
async fn test_transport_errors_surface() {
    let (broker, session, _events) = test_session();
    broker.fail_next_connect(LinkError::new("Connection refused: Bad username or password"));

    let outcome = RegistrationClient::new(session)
        .register(RegistrationRequest::new("device-1"))
        .await;
    assert!(matches!(
        outcome,
        Err(RegistrationError::Transport(TransportError::Unauthorized(_)))
    ));
}
