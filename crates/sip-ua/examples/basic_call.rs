//! Scripted call flow against the in-memory mock stack.
//!
//! Run with `cargo run --example basic_call` to watch the session
//! state machine progress through a complete call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use sip_core::Method;
use sip_testkit as testkit;
use sip_ua::{Profile, UserAgent, UserAgentConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sip_ua=debug".into()),
        )
        .init();

    let stack = Arc::new(testkit::MockStack::new("198.51.100.7", 5060));
    let ua = UserAgent::new(UserAgentConfig::default(), stack.clone());
    ua.set_invite_handler(Arc::new(|session, _request, _response, state| {
        tracing::info!(call_id = %session.call_id(), %state, "call state");
    }));

    let alice = Profile::new("alice").with_display_name("Alice");
    let session = ua
        .invite(
            &alice,
            "sip:bob@example.com",
            Some(Bytes::from_static(b"v=0 offer")),
            CancellationToken::new(),
        )
        .await?;

    // Play the remote side: ringing, then answer with SDP.
    let invite = stack.requests_of(&Method::Invite).remove(0);
    let driver = stack.next_driver().await.expect("client transaction");
    driver
        .send_response(testkit::provisional(&invite, 180, "Ringing"))
        .await;
    driver
        .send_response(testkit::ok_with_sdp(&invite, "v=0 answer"))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(
        acks = stack.acks().len(),
        answer = ?session.remote_answer(),
        "call established"
    );

    session.end().await?;
    ua.shutdown().await;
    Ok(())
}
