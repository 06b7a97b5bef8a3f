// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the user-agent core.
//!
//! [`MockStack`] implements the full [`SipStack`] contract in memory:
//! every outbound request yields a driver the test feeds with
//! provisionals, finals, or errors; every CANCEL/ACK the agent asks
//! the stack to send is recorded for assertion. Inbound requests are
//! delivered to the registered handlers via [`MockStack::deliver`],
//! which hands back the server-side driver.
//!
//! The message builders construct minimal well-formed fixtures in the
//! shape real stacks produce.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sip_core::{with_tag, Headers, Method, Request, RequestLine, Response, SipUri};
use sip_stack::{
    ClientTransactionDriver, ClientTransactionHandle, InboundHandler, NetworkInfo,
    ServerTransactionDriver, ServerTransactionHandle, SipStack, StackError, TransactionKey,
};
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// In-memory [`SipStack`] with recorded side effects.
pub struct MockStack {
    network: NetworkInfo,
    handlers: DashMap<Method, Arc<dyn InboundHandler>>,
    requests: Mutex<Vec<Request>>,
    cancels: Mutex<Vec<(Request, Response)>>,
    acks: Mutex<Vec<(Request, Response)>>,
    remembered: Mutex<Vec<Request>>,
    driver_tx: mpsc::UnboundedSender<ClientTransactionDriver>,
    driver_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientTransactionDriver>>,
    shutdown: AtomicBool,
}

impl MockStack {
    pub fn new(host: &str, port: u16) -> Self {
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();
        Self {
            network: NetworkInfo {
                host: SmolStr::new(host.to_owned()),
                port,
            },
            handlers: DashMap::new(),
            requests: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            remembered: Mutex::new(Vec::new()),
            driver_tx,
            driver_rx: tokio::sync::Mutex::new(driver_rx),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Waits for the next client transaction created by the agent.
    pub async fn next_driver(&self) -> Option<ClientTransactionDriver> {
        self.driver_rx.lock().await.recv().await
    }

    /// Delivers an inbound request to the registered handler, awaiting
    /// its completion. Returns the server-side driver, or `None` when
    /// no handler is registered for the method.
    pub async fn deliver(&self, request: Request) -> Option<ServerTransactionDriver> {
        let handler = self
            .handlers
            .get(&request.start.method)
            .map(|entry| entry.value().clone())?;
        let key = TransactionKey::new(branch_of(&request), request.start.method.clone());
        let (handle, driver) = ServerTransactionHandle::channel(key);
        handler.handle(request, handle).await;
        Some(driver)
    }

    /// All requests submitted through [`SipStack::request`].
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Submitted requests of one method.
    pub fn requests_of(&self, method: &Method) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| &r.start.method == method)
            .collect()
    }

    /// Recorded CANCELs: (original request, last provisional).
    pub fn cancels(&self) -> Vec<(Request, Response)> {
        self.cancels.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Recorded ACKs: (INVITE, 2xx response).
    pub fn acks(&self) -> Vec<(Request, Response)> {
        self.acks.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// INVITEs the agent asked the stack to remember.
    pub fn remembered(&self) -> Vec<Request> {
        self.remembered.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn record<T>(slot: &Mutex<Vec<T>>, value: T) {
        if let Ok(mut guard) = slot.lock() {
            guard.push(value);
        }
    }
}

#[async_trait]
impl SipStack for MockStack {
    fn on_request(&self, method: Method, handler: Arc<dyn InboundHandler>) {
        self.handlers.insert(method, handler);
    }

    async fn request(&self, request: Request) -> Result<ClientTransactionHandle, StackError> {
        if self.is_shutdown() {
            return Err(StackError::Transport("stack is shut down".to_owned()));
        }
        let key = TransactionKey::new(branch_of(&request), request.start.method.clone());
        Self::record(&self.requests, request);
        let (handle, driver) = ClientTransactionHandle::channel(key);
        self.driver_tx
            .send(driver)
            .map_err(|_| StackError::Closed)?;
        Ok(handle)
    }

    async fn cancel_request(
        &self,
        request: &Request,
        last_response: &Response,
    ) -> Result<(), StackError> {
        Self::record(&self.cancels, (request.clone(), last_response.clone()));
        Ok(())
    }

    async fn ack_invite(&self, request: &Request, response: &Response) -> Result<(), StackError> {
        Self::record(&self.acks, (request.clone(), response.clone()));
        Ok(())
    }

    async fn remember_invite(&self, request: &Request) {
        Self::record(&self.remembered, request.clone());
    }

    fn network_info(&self, _transport: &str) -> NetworkInfo {
        self.network.clone()
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Extracts the branch parameter from the top Via, with a stable
/// fallback for fixtures built without one.
pub fn branch_of(request: &Request) -> SmolStr {
    request
        .headers
        .get("Via")
        .and_then(|via| {
            via.split(';').skip(1).find_map(|part| {
                let mut split = part.splitn(2, '=');
                let name = split.next()?.trim();
                let value = split.next()?.trim();
                if name.eq_ignore_ascii_case("branch") {
                    Some(SmolStr::new(value.to_owned()))
                } else {
                    None
                }
            })
        })
        .unwrap_or_else(|| SmolStr::new("z9hG4bKmock"))
}

/// Constructs a minimal inbound INVITE for the provided Call-ID.
pub fn build_invite(uri: &str, branch: &str, call_id: &str, sdp: Option<&str>) -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        SmolStr::new(format!("SIP/2.0/UDP peer.example.com:5060;branch={}", branch)),
    );
    headers.push("From", "<sip:alice@example.com>;tag=peer1");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", SmolStr::new(call_id.to_owned()));
    headers.push("CSeq", "1 INVITE");
    headers.push("Max-Forwards", "70");
    headers.push("Contact", "<sip:alice@peer.example.com:5060>");

    let body = match sdp {
        Some(sdp) => {
            headers.push("Content-Type", "application/sdp");
            headers.push("Content-Length", SmolStr::new(sdp.len().to_string()));
            Bytes::from(sdp.as_bytes().to_vec())
        }
        None => {
            headers.push("Content-Length", "0");
            Bytes::new()
        }
    };

    Request::new(
        RequestLine::new(Method::Invite, parse_uri(uri)),
        headers,
        body,
    )
}

/// Constructs an in-dialog request (ACK, BYE, CANCEL) matching a
/// previously delivered INVITE.
pub fn build_in_dialog(method: Method, uri: &str, branch: &str, call_id: &str) -> Request {
    // ACK and CANCEL reuse the INVITE's CSeq number (RFC 3261 §9.1,
    // §13.2.2.4); BYE advances it.
    let cseq_num = if method == Method::Bye { 2 } else { 1 };
    let cseq = SmolStr::new(format!("{} {}", cseq_num, method.as_str()));
    let mut headers = Headers::new();
    headers.push(
        "Via",
        SmolStr::new(format!("SIP/2.0/UDP peer.example.com:5060;branch={}", branch)),
    );
    headers.push("From", "<sip:alice@example.com>;tag=peer1");
    headers.push("To", "<sip:bob@example.com>;tag=callee1");
    headers.push("Call-ID", SmolStr::new(call_id.to_owned()));
    headers.push("CSeq", cseq);
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");

    Request::new(RequestLine::new(method, parse_uri(uri)), headers, Bytes::new())
}

/// A provisional response mirroring the request's dialog headers.
pub fn provisional(request: &Request, code: u16, reason: &str) -> Response {
    Response::from_request(request, code, reason)
}

/// A provisional carrying an SDP body (early media).
pub fn provisional_with_sdp(request: &Request, code: u16, reason: &str, sdp: &str) -> Response {
    let mut response = Response::from_request(request, code, reason);
    response.set_body("application/sdp", Bytes::from(sdp.as_bytes().to_vec()));
    response
}

/// A final response with a To tag, as a remote UAS would send it.
pub fn final_response(request: &Request, code: u16, reason: &str) -> Response {
    let mut response = Response::from_request(request, code, reason);
    if let Some(to) = response.headers.get("To").cloned() {
        response.headers.replace("To", with_tag(&to, "remote1"));
    }
    response
}

/// A 200 OK with a To tag, remote Contact, and SDP answer.
pub fn ok_with_sdp(request: &Request, sdp: &str) -> Response {
    let mut response = final_response(request, 200, "OK");
    response
        .headers
        .push("Contact", "<sip:callee@192.0.2.99:5070>");
    response.set_body("application/sdp", Bytes::from(sdp.as_bytes().to_vec()));
    response
}

/// A 401 challenge carrying a Digest WWW-Authenticate header.
pub fn challenge_401(request: &Request, realm: &str, nonce: &str) -> Response {
    let mut response = final_response(request, 401, "Unauthorized");
    response.headers.push(
        "WWW-Authenticate",
        SmolStr::new(format!("Digest realm=\"{}\", nonce=\"{}\"", realm, nonce)),
    );
    response
}

/// A 200 OK to REGISTER carrying a server-assigned Expires.
pub fn ok_register(request: &Request, expires: u32) -> Response {
    let mut response = final_response(request, 200, "OK");
    response
        .headers
        .push("Expires", SmolStr::new(expires.to_string()));
    response
}

fn parse_uri(uri: &str) -> SipUri {
    SipUri::parse(uri).unwrap_or_else(|| SipUri::new("invalid.invalid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_submitted_requests() {
        let stack = MockStack::new("192.0.2.1", 5060);
        let request = build_invite("sip:bob@example.com", "z9hG4bKa1", "call-1", None);
        let _handle = stack.request(request).await.unwrap();

        assert_eq!(stack.requests().len(), 1);
        assert_eq!(stack.requests_of(&Method::Invite).len(), 1);
        let driver = stack.next_driver().await.unwrap();
        assert_eq!(driver.key.branch.as_str(), "z9hG4bKa1");
    }

    #[tokio::test]
    async fn driver_feeds_handle() {
        let stack = MockStack::new("192.0.2.1", 5060);
        let request = build_invite("sip:bob@example.com", "z9hG4bKa2", "call-2", None);
        let mut handle = stack.request(request.clone()).await.unwrap();
        let driver = stack.next_driver().await.unwrap();

        assert!(driver.send_response(provisional(&request, 180, "Ringing")).await);
        assert_eq!(handle.responses.recv().await.unwrap().code(), 180);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_requests() {
        let stack = MockStack::new("192.0.2.1", 5060);
        stack.shutdown().await;
        let request = build_invite("sip:bob@example.com", "z9hG4bKa3", "call-3", None);
        assert!(stack.request(request).await.is_err());
    }

    #[test]
    fn branch_extraction_falls_back() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP host");
        let request = Request::new(
            RequestLine::new(Method::Invite, parse_uri("sip:a@b.c")),
            headers,
            Bytes::new(),
        );
        assert_eq!(branch_of(&request).as_str(), "z9hG4bKmock");
    }

    #[test]
    fn final_response_carries_to_tag() {
        let request = build_invite("sip:bob@example.com", "z9hG4bKa4", "call-4", None);
        let response = final_response(&request, 200, "OK");
        assert!(response.headers.get("To").map(|v| v.contains(";tag=")).unwrap_or(false));
    }
}
