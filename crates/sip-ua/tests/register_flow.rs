// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registrar client flows: plain registration, digest retry, failures.

use std::sync::{Arc, Mutex};

use sip_core::Method;
use sip_stack::TxError;
use sip_testkit as testkit;
use sip_ua::{Profile, RegisterState, UserAgent, UserAgentConfig};

type RegisterLog = Arc<Mutex<Vec<RegisterState>>>;

fn new_agent() -> (UserAgent, Arc<testkit::MockStack>, RegisterLog) {
    let stack = Arc::new(testkit::MockStack::new("198.51.100.7", 5060));
    let ua = UserAgent::new(UserAgentConfig::default(), stack.clone());

    let log: RegisterLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    ua.set_register_handler(Arc::new(move |state| {
        sink.lock().unwrap().push(state.clone());
    }));
    (ua, stack, log)
}

#[tokio::test]
async fn register_success_uses_server_expires() {
    let (ua, stack, log) = new_agent();
    let profile = Profile::new("alice");

    let register = ua.send_register(&profile, "sip:registrar.example.com", 600);
    let drive = async {
        let driver = stack.next_driver().await.unwrap();
        let request = stack.requests_of(&Method::Register).remove(0);
        assert_eq!(request.headers.get("Expires").map(|v| v.as_str()), Some("600"));
        // Registrar shortens the binding to 300s.
        assert!(driver.send_response(testkit::ok_register(&request, 300)).await);
    };
    let (state, _) = tokio::join!(register, drive);

    let state = state.unwrap();
    assert_eq!(state.status_code, 200);
    assert_eq!(state.expiration, 300);
    assert!(state.response.is_some());

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status_code, 200);
}

#[tokio::test]
async fn register_without_server_expires_reports_requested_value() {
    let (ua, stack, _log) = new_agent();
    let profile = Profile::new("alice");

    let register = ua.send_register(&profile, "sip:registrar.example.com", 600);
    let drive = async {
        let driver = stack.next_driver().await.unwrap();
        let request = stack.requests_of(&Method::Register).remove(0);
        assert!(driver.send_response(testkit::final_response(&request, 200, "OK")).await);
    };
    let (state, _) = tokio::join!(register, drive);

    assert_eq!(state.unwrap().expiration, 600);
}

#[tokio::test]
async fn register_digest_retry() {
    let (ua, stack, log) = new_agent();
    let profile = Profile::new("alice").with_auth("alice", "secret");

    let register = ua.send_register(&profile, "sip:registrar.example.com", 600);
    let drive = async {
        let driver = stack.next_driver().await.unwrap();
        let first = stack.requests_of(&Method::Register).remove(0);
        assert!(first.headers.get("Authorization").is_none());
        assert!(
            driver
                .send_response(testkit::challenge_401(&first, "example.com", "abc123"))
                .await
        );

        // The replayed REGISTER carries credentials and a bumped CSeq.
        let retry_driver = stack.next_driver().await.unwrap();
        let registers = stack.requests_of(&Method::Register);
        assert_eq!(registers.len(), 2);
        let second = registers[1].clone();
        let authorization = second.headers.get("Authorization").expect("Authorization");
        assert!(authorization.starts_with("Digest username=\"alice\""));
        assert!(authorization.contains("realm=\"example.com\""));
        assert_eq!(second.cseq().map(|(n, _)| n), Some(2));
        assert!(
            retry_driver
                .send_response(testkit::ok_register(&second, 600))
                .await
        );
    };
    let (state, _) = tokio::join!(register, drive);

    let state = state.unwrap();
    assert_eq!(state.status_code, 200);
    assert_eq!(state.expiration, 600);

    // Exactly two transactions; the handler fired once.
    assert_eq!(stack.requests_of(&Method::Register).len(), 2);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn register_second_challenge_is_terminal() {
    let (ua, stack, log) = new_agent();
    let profile = Profile::new("alice").with_auth("alice", "wrong-password");

    let register = ua.send_register(&profile, "sip:registrar.example.com", 600);
    let drive = async {
        let driver = stack.next_driver().await.unwrap();
        let first = stack.requests_of(&Method::Register).remove(0);
        assert!(
            driver
                .send_response(testkit::challenge_401(&first, "example.com", "abc123"))
                .await
        );

        let retry_driver = stack.next_driver().await.unwrap();
        let second = stack.requests_of(&Method::Register)[1].clone();
        assert!(
            retry_driver
                .send_response(testkit::challenge_401(&second, "example.com", "def456"))
                .await
        );
    };
    let (state, _) = tokio::join!(register, drive);

    let state = state.unwrap();
    assert_eq!(state.status_code, 401);
    assert_eq!(state.expiration, 0);
    assert!(state.response.is_none());

    // No third attempt.
    assert_eq!(stack.requests_of(&Method::Register).len(), 2);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn register_challenge_without_credentials_is_rejected() {
    let (ua, stack, _log) = new_agent();
    let profile = Profile::new("alice");

    let register = ua.send_register(&profile, "sip:registrar.example.com", 600);
    let drive = async {
        let driver = stack.next_driver().await.unwrap();
        let request = stack.requests_of(&Method::Register).remove(0);
        assert!(
            driver
                .send_response(testkit::challenge_401(&request, "example.com", "abc123"))
                .await
        );
    };
    let (state, _) = tokio::join!(register, drive);

    let state = state.unwrap();
    assert_eq!(state.status_code, 401);
    assert_eq!(stack.requests_of(&Method::Register).len(), 1);
}

#[tokio::test]
async fn register_timeout_reports_408() {
    let (ua, stack, log) = new_agent();
    let profile = Profile::new("alice");

    let register = ua.send_register(&profile, "sip:registrar.example.com", 600);
    let drive = async {
        let driver = stack.next_driver().await.unwrap();
        assert!(driver.send_error(TxError::Timeout).await);
    };
    let (state, _) = tokio::join!(register, drive);

    let state = state.unwrap();
    assert_eq!(state.status_code, 408);
    assert_eq!(state.reason.as_str(), "Request Timeout");
    assert_eq!(state.expiration, 0);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn register_carries_identity_headers() {
    let (ua, stack, _log) = new_agent();
    let profile = Profile::new("alice").with_display_name("Alice");

    let register = ua.send_register(&profile, "sip:registrar.example.com", 600);
    let drive = async {
        let driver = stack.next_driver().await.unwrap();
        let request = stack.requests_of(&Method::Register).remove(0);

        let from = request.headers.get("From").expect("From");
        assert!(from.starts_with("\"Alice\" <sip:alice@registrar.example.com>"));
        assert!(from.contains(";tag="));

        let contact = request.headers.get("Contact").expect("Contact");
        assert!(contact.contains("198.51.100.7:5060"));
        assert!(contact.contains("+sip.instance=\"<urn:uuid:"));

        assert!(request.headers.get("User-Agent").is_some());
        assert!(driver.send_response(testkit::ok_register(&request, 600)).await);
    };
    let (state, _) = tokio::join!(register, drive);
    assert_eq!(state.unwrap().status_code, 200);
}

#[tokio::test]
async fn register_invalid_target_fails_without_handler() {
    let (ua, _stack, log) = new_agent();
    let profile = Profile::new("alice");

    let result = ua.send_register(&profile, "not-a-uri", 600).await;
    assert!(result.is_err());
    assert!(log.lock().unwrap().is_empty());
}
