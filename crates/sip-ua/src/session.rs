// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-dialog INVITE session state.
//!
//! A session is created when an INVITE is sent (UAC) or received
//! (UAS) and lives in the [`SessionStore`](crate::store::SessionStore)
//! until a terminal transition. Mutable state sits behind one mutex;
//! state-change callbacks are always invoked after the lock is
//! released.
//!
//! Follow-up requests (BYE, re-INVITE) are built here and routed back
//! through the request coordinator, which the session holds as a weak
//! capability to avoid an ownership cycle with the store.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use sip_core::{
    contact_uri, name_addr_uri, record_routes, with_tag, Headers, Method, Request, RequestLine,
    Response, SipUri,
};
use sip_stack::ServerTransactionHandle;
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;

use crate::{
    builder,
    coordinator::{Coordinator, RequestContext},
    error::UaError,
};

/// Which side of the dialog this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

/// Direction of the dialog-creating INVITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Session states of the INVITE state machine.
///
/// The machine is monotonic toward a terminal state; once `Terminated`,
/// `Canceled`, or `Failure` is reached no further transitions are
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Null,
    InviteSent,
    InviteReceived,
    Provisional,
    EarlyMedia,
    WaitingForAnswer,
    Answer,
    Confirmed,
    ReInviteReceived,
    Canceled,
    Failure,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Canceled | SessionState::Failure | SessionState::Terminated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Null => "Null",
            SessionState::InviteSent => "InviteSent",
            SessionState::InviteReceived => "InviteReceived",
            SessionState::Provisional => "Provisional",
            SessionState::EarlyMedia => "EarlyMedia",
            SessionState::WaitingForAnswer => "WaitingForAnswer",
            SessionState::Answer => "Answer",
            SessionState::Confirmed => "Confirmed",
            SessionState::ReInviteReceived => "ReInviteReceived",
            SessionState::Canceled => "Canceled",
            SessionState::Failure => "Failure",
            SessionState::Terminated => "Terminated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    contact: Option<SmolStr>,
    remote_target: Option<SipUri>,
    route_set: Vec<SmolStr>,
    local_tag: Option<SmolStr>,
    last_request: Option<Request>,
    last_response: Option<Response>,
    server_tx: Option<ServerTransactionHandle>,
    local_offer: Option<Bytes>,
    remote_offer: Option<Bytes>,
    local_answer: Option<Bytes>,
    remote_answer: Option<Bytes>,
    local_cseq: u32,
}

/// One INVITE dialog.
pub struct InviteSession {
    call_id: SmolStr,
    role: Role,
    direction: Direction,
    coordinator: Weak<Coordinator>,
    inner: Mutex<SessionInner>,
}

impl InviteSession {
    pub(crate) fn new_uac(
        coordinator: &Arc<Coordinator>,
        call_id: SmolStr,
        contact: Option<SmolStr>,
        request: Request,
    ) -> Arc<Self> {
        let local_cseq = request.cseq().map(|(num, _)| num).unwrap_or(1);
        Arc::new(Self {
            call_id,
            role: Role::Uac,
            direction: Direction::Outgoing,
            coordinator: Arc::downgrade(coordinator),
            inner: Mutex::new(SessionInner {
                contact,
                local_tag: sip_core::from_tag(&request.headers),
                last_request: Some(request),
                local_cseq,
                ..SessionInner::default()
            }),
        })
    }

    pub(crate) fn new_uas(
        coordinator: &Arc<Coordinator>,
        call_id: SmolStr,
        contact: Option<SmolStr>,
        request: Request,
        transaction: ServerTransactionHandle,
    ) -> Arc<Self> {
        let remote_offer = (!request.body.is_empty()).then(|| request.body.clone());
        let route_set = record_routes(&request.headers);
        Arc::new(Self {
            call_id,
            role: Role::Uas,
            direction: Direction::Incoming,
            coordinator: Arc::downgrade(coordinator),
            inner: Mutex::new(SessionInner {
                contact,
                route_set,
                last_request: Some(request),
                server_tx: Some(transaction),
                remote_offer,
                ..SessionInner::default()
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn core(&self) -> Result<Arc<Coordinator>, UaError> {
        self.coordinator
            .upgrade()
            .ok_or(UaError::Dialog("user agent has shut down"))
    }

    pub fn call_id(&self) -> &SmolStr {
        &self.call_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    /// Remote Contact header value from the initial request.
    pub fn contact(&self) -> Option<SmolStr> {
        self.inner().contact.clone()
    }

    pub fn last_request(&self) -> Option<Request> {
        self.inner().last_request.clone()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.inner().last_response.clone()
    }

    pub fn local_offer(&self) -> Option<Bytes> {
        self.inner().local_offer.clone()
    }

    pub fn remote_offer(&self) -> Option<Bytes> {
        self.inner().remote_offer.clone()
    }

    pub fn local_answer(&self) -> Option<Bytes> {
        self.inner().local_answer.clone()
    }

    pub fn remote_answer(&self) -> Option<Bytes> {
        self.inner().remote_answer.clone()
    }

    /// Remote target learned from the 2xx Contact, if any.
    pub fn remote_target(&self) -> Option<SipUri> {
        self.inner().remote_target.clone()
    }

    /// Advances the state machine. Returns false — and changes nothing —
    /// when the session is already in a terminal state.
    pub(crate) fn set_state(&self, state: SessionState) -> bool {
        let mut inner = self.inner();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = state;
        true
    }

    pub(crate) fn store_request(&self, request: Request) {
        self.inner().last_request = Some(request);
    }

    pub(crate) fn store_response(&self, response: Response) {
        self.inner().last_response = Some(response);
    }

    pub(crate) fn store_transaction(&self, transaction: ServerTransactionHandle) {
        self.inner().server_tx = Some(transaction);
    }

    /// Stores the local SDP offer verbatim.
    pub fn provide_offer(&self, body: Bytes) {
        self.inner().local_offer = Some(body);
    }

    /// Stores the local SDP answer verbatim.
    pub fn provide_answer(&self, body: Bytes) {
        self.inner().local_answer = Some(body);
    }

    pub(crate) fn set_remote_offer(&self, body: Bytes) {
        self.inner().remote_offer = Some(body);
    }

    /// Captures remote target, route set, and SDP from the 2xx that
    /// confirmed the dialog.
    pub(crate) fn complete_dialog(&self, response: &Response) {
        let mut inner = self.inner();
        if !response.body.is_empty() {
            if inner.local_offer.is_some() {
                inner.remote_answer = Some(response.body.clone());
            } else {
                inner.remote_offer = Some(response.body.clone());
            }
        }
        if let Some(uri) = contact_uri(&response.headers) {
            inner.remote_target = Some(uri);
        }
        let routes = record_routes(&response.headers);
        if !routes.is_empty() {
            inner.route_set = routes;
        }
    }

    /// Answers a pending inbound INVITE with 200 OK carrying `sdp`.
    ///
    /// The session moves to `Answer`; `Confirmed` follows when the ACK
    /// arrives at the dispatcher.
    pub async fn accept(self: &Arc<Self>, sdp: Bytes) -> Result<(), UaError> {
        if self.role != Role::Uas {
            return Err(UaError::Dialog("accept is a UAS operation"));
        }
        let core = self.core()?;

        let (invite, transaction, local_tag) = {
            let mut inner = self.inner();
            if inner.state != SessionState::WaitingForAnswer {
                return Err(UaError::Dialog("accept requires a pending INVITE"));
            }
            let invite = inner
                .last_request
                .clone()
                .ok_or(UaError::Dialog("no INVITE stored on session"))?;
            let transaction = inner
                .server_tx
                .clone()
                .ok_or(UaError::Dialog("no server transaction stored"))?;
            let local_tag = inner
                .local_tag
                .get_or_insert_with(builder::random_tag)
                .clone();
            (invite, transaction, local_tag)
        };

        let mut response = Response::from_request(&invite, 200, "OK");
        if let Some(to) = response.headers.get("To").cloned() {
            response.headers.replace("To", with_tag(&to, &local_tag));
        }
        let contact = core.contact_address(&invite.start.uri, None);
        response.headers.push("Contact", contact.to_string());
        response.set_body("application/sdp", sdp.clone());

        transaction
            .respond(response.clone())
            .await
            .map_err(|e| UaError::Transport(e.to_string()))?;

        self.provide_answer(sdp);
        core.emit(self, Some(&invite), Some(&response), SessionState::Answer);
        Ok(())
    }

    /// Rejects a pending inbound INVITE with a final non-2xx response.
    pub async fn reject(self: &Arc<Self>, code: u16, reason: &str) -> Result<(), UaError> {
        if self.role != Role::Uas {
            return Err(UaError::Dialog("reject is a UAS operation"));
        }
        if !(300..700).contains(&code) {
            return Err(UaError::Dialog("reject requires a non-2xx final status"));
        }
        let core = self.core()?;

        let (invite, transaction, local_tag) = {
            let mut inner = self.inner();
            if inner.state.is_terminal() || inner.state == SessionState::Confirmed {
                return Err(UaError::Dialog("reject requires an unanswered INVITE"));
            }
            let invite = inner
                .last_request
                .clone()
                .ok_or(UaError::Dialog("no INVITE stored on session"))?;
            let transaction = inner
                .server_tx
                .clone()
                .ok_or(UaError::Dialog("no server transaction stored"))?;
            let local_tag = inner
                .local_tag
                .get_or_insert_with(builder::random_tag)
                .clone();
            (invite, transaction, local_tag)
        };

        let mut response = Response::from_request(&invite, code, reason);
        if let Some(to) = response.headers.get("To").cloned() {
            response.headers.replace("To", with_tag(&to, &local_tag));
        }

        transaction
            .respond(response.clone())
            .await
            .map_err(|e| UaError::Transport(e.to_string()))?;

        core.sessions.remove(&self.call_id);
        core.emit(self, Some(&invite), Some(&response), SessionState::Terminated);
        Ok(())
    }

    /// Terminates the dialog by sending BYE.
    pub async fn end(self: &Arc<Self>) -> Result<(), UaError> {
        let core = self.core()?;
        if self.state().is_terminal() {
            return Err(UaError::Dialog("session already terminated"));
        }

        let bye = self.dialog_request(Method::Bye)?;
        core.request_with_context(
            bye.clone(),
            RequestContext {
                cancel: CancellationToken::new(),
                authorizer: None,
                wait_for_final: false,
            },
        )
        .await?;

        core.sessions.remove(&self.call_id);
        core.emit(self, Some(&bye), None, SessionState::Terminated);
        Ok(())
    }

    /// Sends a mid-dialog re-INVITE, optionally with a new offer.
    pub async fn re_invite(self: &Arc<Self>, sdp: Option<Bytes>) -> Result<(), UaError> {
        let core = self.core()?;
        if self.state() != SessionState::Confirmed {
            return Err(UaError::Dialog("re-INVITE requires a confirmed dialog"));
        }

        let mut invite = self.dialog_request(Method::Invite)?;
        if let Some(sdp) = sdp {
            invite.set_body("application/sdp", sdp.clone());
            self.provide_offer(sdp);
        }
        self.store_request(invite.clone());

        core.request_with_context(
            invite,
            RequestContext {
                cancel: CancellationToken::new(),
                authorizer: None,
                wait_for_final: false,
            },
        )
        .await?;
        Ok(())
    }

    /// Builds an in-dialog request: same Call-ID, next CSeq, From/To
    /// oriented by role, Route copied from the recorded route set, and
    /// the remote target (2xx Contact) as request URI.
    pub(crate) fn dialog_request(&self, method: Method) -> Result<Request, UaError> {
        let core = self.core()?;
        let mut inner = self.inner();

        let base = inner
            .last_request
            .clone()
            .ok_or(UaError::Dialog("no request on dialog"))?;

        let (from_value, to_value) = match self.role {
            Role::Uac => {
                let from = base
                    .headers
                    .get("From")
                    .cloned()
                    .ok_or(UaError::Dialog("dialog request missing From"))?;
                let to = inner
                    .last_response
                    .as_ref()
                    .and_then(|r| r.headers.get("To").cloned())
                    .or_else(|| base.headers.get("To").cloned())
                    .ok_or(UaError::Dialog("dialog request missing To"))?;
                (from, to)
            }
            Role::Uas => {
                let remote = base
                    .headers
                    .get("From")
                    .cloned()
                    .ok_or(UaError::Dialog("dialog request missing From"))?;
                let local = base
                    .headers
                    .get("To")
                    .cloned()
                    .ok_or(UaError::Dialog("dialog request missing To"))?;
                let local = match &inner.local_tag {
                    Some(tag) => with_tag(&local, tag),
                    None => local,
                };
                (local, remote)
            }
        };

        let uri = inner
            .remote_target
            .clone()
            .or_else(|| inner.contact.as_ref().and_then(|c| name_addr_uri(c)))
            .unwrap_or_else(|| base.start.uri.clone());

        // UAC reverses the recorded route set per RFC 3261 §12.2.1.1.
        let routes: Vec<SmolStr> = match self.role {
            Role::Uac => inner.route_set.iter().rev().cloned().collect(),
            Role::Uas => inner.route_set.clone(),
        };

        inner.local_cseq += 1;
        let cseq = inner.local_cseq;
        drop(inner);

        let mut headers = Headers::new();
        headers.push("Via", core.via_hop(&uri));
        headers.push("Max-Forwards", "70");
        headers.push("From", from_value);
        headers.push("To", to_value);
        headers.push("Call-ID", self.call_id.clone());
        headers.push("CSeq", format!("{} {}", cseq, method.as_str()));
        for route in routes {
            headers.push("Route", route);
        }
        headers.push("User-Agent", core.config.user_agent.clone());
        headers.push("Content-Length", "0");

        Ok(Request::new(
            RequestLine::new(method, uri),
            headers,
            Bytes::new(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{coordinator::Coordinator, UserAgentConfig};
    use sip_core::StatusLine;
    use sip_testkit::MockStack;

    fn coordinator() -> Arc<Coordinator> {
        let stack = Arc::new(MockStack::new("198.51.100.7", 5060));
        Coordinator::new(UserAgentConfig::default(), stack)
    }

    fn uac_invite() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 198.51.100.7:5060;branch=z9hG4bKabc");
        headers.push("From", "<sip:alice@example.com>;tag=alice1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "dlg-1@198.51.100.7");
        headers.push("CSeq", "1 INVITE");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn ok_response() -> Response {
        let mut headers = Headers::new();
        headers.push("From", "<sip:alice@example.com>;tag=alice1");
        headers.push("To", "<sip:bob@example.com>;tag=bob9");
        headers.push("Call-ID", "dlg-1@198.51.100.7");
        headers.push("CSeq", "1 INVITE");
        headers.push("Contact", "<sip:bob@192.0.2.44:5070>");
        headers.push("Record-Route", "<sip:p1.example.com;lr>");
        headers.push("Record-Route", "<sip:p2.example.com;lr>");
        Response::new(StatusLine::new(200, "OK"), headers, Bytes::from_static(b"v=0 answer"))
    }

    #[test]
    fn terminal_states_are_sticky() {
        let core = coordinator();
        let session = InviteSession::new_uac(
            &core,
            SmolStr::new("dlg-1@198.51.100.7"),
            None,
            uac_invite(),
        );

        assert!(session.set_state(SessionState::InviteSent));
        assert!(session.set_state(SessionState::Terminated));
        assert!(!session.set_state(SessionState::Confirmed));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.set_state(SessionState::Canceled));
    }

    #[test]
    fn offers_and_answers_are_stored_verbatim() {
        let core = coordinator();
        let session = InviteSession::new_uac(
            &core,
            SmolStr::new("dlg-1@198.51.100.7"),
            None,
            uac_invite(),
        );

        session.provide_offer(Bytes::from_static(b"v=0 offer"));
        assert_eq!(session.local_offer(), Some(Bytes::from_static(b"v=0 offer")));

        session.complete_dialog(&ok_response());
        assert_eq!(
            session.remote_answer(),
            Some(Bytes::from_static(b"v=0 answer"))
        );
    }

    #[test]
    fn dialog_bye_targets_remote_contact_with_reversed_routes() {
        let core = coordinator();
        let session = InviteSession::new_uac(
            &core,
            SmolStr::new("dlg-1@198.51.100.7"),
            None,
            uac_invite(),
        );
        session.store_response(ok_response());
        session.complete_dialog(&ok_response());

        let bye = session.dialog_request(Method::Bye).unwrap();

        assert_eq!(bye.start.method, Method::Bye);
        assert_eq!(bye.start.uri.host.as_str(), "192.0.2.44");
        assert_eq!(
            bye.headers.get("CSeq").map(|v| v.as_str()),
            Some("2 BYE")
        );
        assert_eq!(
            bye.headers.get("To").map(|v| v.as_str()),
            Some("<sip:bob@example.com>;tag=bob9")
        );
        let routes: Vec<&str> = bye.headers.get_all("Route").map(|v| v.as_str()).collect();
        assert_eq!(
            routes,
            vec!["<sip:p2.example.com;lr>", "<sip:p1.example.com;lr>"]
        );
        assert_eq!(
            bye.headers.get("Call-ID").map(|v| v.as_str()),
            Some("dlg-1@198.51.100.7")
        );
    }

    #[test]
    fn successive_dialog_requests_increment_cseq() {
        let core = coordinator();
        let session = InviteSession::new_uac(
            &core,
            SmolStr::new("dlg-1@198.51.100.7"),
            None,
            uac_invite(),
        );
        session.store_response(ok_response());

        let first = session.dialog_request(Method::Invite).unwrap();
        let second = session.dialog_request(Method::Bye).unwrap();
        assert_eq!(first.cseq().map(|(n, _)| n), Some(2));
        assert_eq!(second.cseq().map(|(n, _)| n), Some(3));
    }
}
