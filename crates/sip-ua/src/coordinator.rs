// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The request coordinator.
//!
//! [`Coordinator::request_with_context`] submits a request to the
//! stack and drains the client transaction's event streams from a
//! spawned task, promoting events into session state transitions:
//! provisionals become `Provisional`/`EarlyMedia`, a 2xx becomes
//! `Confirmed` (with ACK handling for INVITE), errors and non-2xx
//! finals tear the session down. 401/407 challenges are answered by
//! replaying the request once with credentials. Cancellation of the
//! caller's token sends CANCEL when a provisional was seen and
//! resolves the call with 487 Request Terminated.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use sip_auth::Authorizer;
use sip_core::{Request, Response};
use sip_observe::signaling_metrics;
use sip_stack::{ClientTransactionHandle, SipStack, TxError};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::UaError,
    session::{InviteSession, SessionState},
    store::SessionStore,
    InviteSessionHandler, RegisterHandler, UserAgentConfig,
};

/// Per-call inputs of [`Coordinator::request_with_context`].
pub struct RequestContext {
    /// Caller-side cancellation handle. Cancelling after a provisional
    /// has been observed sends CANCEL per RFC 3261 §9.1.
    pub cancel: CancellationToken,
    /// Answers one 401/407 challenge by replaying the request.
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// When false, the call dispatches asynchronously and returns
    /// `Ok(None)`; completion is observable via session callbacks only.
    pub wait_for_final: bool,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            authorizer: None,
            wait_for_final: true,
        }
    }
}

/// Final response paired with the deduplicated provisionals that
/// preceded it.
struct FinalResponse {
    response: Response,
    previous: Vec<Response>,
}

/// How the transaction event loop ended.
enum LoopOutcome {
    /// 2xx final to hand to the waiter (ACK duties still pending).
    Final(Response),
    /// 401/407 with an authorizer available.
    Challenge(Response),
    /// Caller cancelled; remaining transaction events must be drained.
    Canceled,
    /// A terminal error was already delivered.
    Finished,
}

/// Shared core of the user agent: stack access, the session store, and
/// the state-change callbacks. Sessions hold it weakly as the
/// capability for issuing follow-up requests.
pub struct Coordinator {
    pub(crate) config: UserAgentConfig,
    pub(crate) stack: Arc<dyn SipStack>,
    pub(crate) sessions: SessionStore,
    invite_handler: RwLock<Option<InviteSessionHandler>>,
    register_handler: RwLock<Option<RegisterHandler>>,
}

impl Coordinator {
    pub(crate) fn new(config: UserAgentConfig, stack: Arc<dyn SipStack>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stack,
            sessions: SessionStore::new(),
            invite_handler: RwLock::new(None),
            register_handler: RwLock::new(None),
        })
    }

    pub(crate) fn set_invite_handler(&self, handler: InviteSessionHandler) {
        if let Ok(mut slot) = self.invite_handler.write() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn set_register_handler(&self, handler: RegisterHandler) {
        if let Ok(mut slot) = self.register_handler.write() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn register_handler(&self) -> Option<RegisterHandler> {
        self.register_handler.read().ok().and_then(|g| g.clone())
    }

    /// Applies a state transition and invokes the session handler.
    ///
    /// The triggering request/response are stored on the session first;
    /// the callback fires outside the session lock, and not at all when
    /// the session already reached a terminal state.
    pub(crate) fn emit(
        &self,
        session: &Arc<InviteSession>,
        request: Option<&Request>,
        response: Option<&Response>,
        state: SessionState,
    ) {
        if let Some(request) = request {
            session.store_request(request.clone());
        }
        if let Some(response) = response {
            session.store_response(response.clone());
        }
        if !session.set_state(state) {
            debug!(call_id = %session.call_id(), state = %state, "transition ignored, session terminal");
            return;
        }

        debug!(call_id = %session.call_id(), state = %state, "session state");
        signaling_metrics().on_session_state(session.call_id(), state.as_str());

        let handler = self.invite_handler.read().ok().and_then(|g| g.clone());
        if let Some(handler) = handler {
            handler(session, request, response, state);
        }
    }

    /// Submits a request and coordinates its transaction to completion.
    ///
    /// Returns the final 2xx when `ctx.wait_for_final` is set, or
    /// `Ok(None)` immediately otherwise. Non-2xx outcomes surface as
    /// [`UaError`] values carrying the last response and the prior
    /// provisionals.
    pub(crate) fn request_with_context(
        self: &Arc<Self>,
        request: Request,
        ctx: RequestContext,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Option<Response>, UaError>> + Send + '_>,
    > {
        Box::pin(async move {
            let tx = self
                .stack
                .request(request.clone())
                .await
                .map_err(|e| UaError::Transport(e.to_string()))?;
            signaling_metrics().on_request_sent(request.start.method.as_str());

            // A fresh outgoing INVITE seeds the UAC session before any
            // transaction event can race it.
            if request.is_invite() {
                if let Some(call_id) = request.call_id().cloned() {
                    if self.sessions.load(&call_id).is_none() {
                        let contact = request.headers.get("Contact").cloned();
                        let session = InviteSession::new_uac(
                            self,
                            call_id.clone(),
                            contact,
                            request.clone(),
                        );
                        self.sessions.insert(call_id, session.clone());
                        if !request.body.is_empty() {
                            session.provide_offer(request.body.clone());
                        }
                        self.emit(&session, Some(&request), None, SessionState::InviteSent);
                    }
                }
            }

            let (final_tx, final_rx) = mpsc::channel(1);
            let (prov_tx, prov_rx) = mpsc::channel(8);
            let (err_tx, err_rx) = mpsc::channel(1);

            tokio::spawn(Self::run_event_loop(
                self.clone(),
                request.clone(),
                tx,
                ctx.cancel.clone(),
                ctx.authorizer.clone(),
                final_tx,
                prov_tx,
                err_tx,
            ));

            if ctx.wait_for_final {
                self.clone()
                    .wait_for_response(request, ctx.cancel, prov_rx, final_rx, err_rx)
                    .await
                    .map(Some)
            } else {
                let core = self.clone();
                tokio::spawn(async move {
                    if let Err(error) = core
                        .wait_for_response(request, ctx.cancel, prov_rx, final_rx, err_rx)
                        .await
                    {
                        debug!(error = %error, "detached request finished with error");
                    }
                });
                Ok(None)
            }
        })
    }

    /// Drains one client transaction, classifying its events.
    #[allow(clippy::too_many_arguments)]
    async fn run_event_loop(
        core: Arc<Coordinator>,
        mut request: Request,
        mut tx: ClientTransactionHandle,
        cancel: CancellationToken,
        authorizer: Option<Arc<dyn Authorizer>>,
        final_tx: mpsc::Sender<FinalResponse>,
        prov_tx: mpsc::Sender<Response>,
        err_tx: mpsc::Sender<UaError>,
    ) {
        let mut last_response: Option<Response> = None;
        let mut previous: Vec<Response> = Vec::new();
        let mut seen_codes: HashSet<u16> = HashSet::new();

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // CANCEL is only legal once a provisional (other
                    // than 100) has been received, RFC 3261 §9.1.
                    let cancelable = last_response
                        .as_ref()
                        .filter(|r| r.is_provisional() && r.code() > 100);
                    if let Some(last) = cancelable {
                        if let Err(error) = core.stack.cancel_request(&request, last).await {
                            warn!(error = %error, "failed to send CANCEL");
                        }
                    }
                    let _ = err_tx
                        .send(UaError::Terminated {
                            response: last_response.take().map(Box::new),
                            previous: std::mem::take(&mut previous),
                        })
                        .await;
                    break LoopOutcome::Canceled;
                }
                error = tx.errors.recv() => {
                    let ua_error = match error {
                        Some(TxError::Timeout) => UaError::Timeout {
                            response: last_response.take().map(Box::new),
                        },
                        Some(TxError::Transport(_)) | None => UaError::Terminated {
                            response: last_response.take().map(Box::new),
                            previous: std::mem::take(&mut previous),
                        },
                    };
                    let _ = err_tx.send(ua_error).await;
                    break LoopOutcome::Finished;
                }
                response = tx.responses.recv() => {
                    let Some(response) = response else {
                        let _ = err_tx
                            .send(UaError::Terminated {
                                response: last_response.take().map(Box::new),
                                previous: std::mem::take(&mut previous),
                            })
                            .await;
                        break LoopOutcome::Finished;
                    };

                    last_response = Some(response.clone());

                    if response.is_provisional() {
                        // 100 Trying is acknowledged but never surfaced.
                        if response.code() > 100 && seen_codes.insert(response.code()) {
                            previous.push(response.clone());
                            if prov_tx.send(response).await.is_err() {
                                break LoopOutcome::Finished;
                            }
                        }
                        continue;
                    }

                    if response.is_success() {
                        break LoopOutcome::Final(response);
                    }

                    if matches!(response.code(), 401 | 407) && authorizer.is_some() {
                        break LoopOutcome::Challenge(response);
                    }

                    let _ = err_tx
                        .send(UaError::Rejected {
                            code: response.code(),
                            reason: SmolStr::new(response.reason().to_owned()),
                            response: Box::new(response),
                            previous: std::mem::take(&mut previous),
                        })
                        .await;
                    break LoopOutcome::Finished;
                }
            }
        };

        match outcome {
            LoopOutcome::Final(response) => {
                if request.is_invite() {
                    if let Err(error) = core.stack.ack_invite(&request, &response).await {
                        warn!(error = %error, "failed to ACK 2xx");
                    }
                    core.stack.remember_invite(&request).await;
                    tx.finish();

                    // ACK any 2xx retransmissions still arriving on the
                    // same transaction.
                    let stack = core.stack.clone();
                    let invite = request.clone();
                    tokio::spawn(async move {
                        while let Some(retransmission) = tx.responses.recv().await {
                            if retransmission.is_success() {
                                if let Err(error) =
                                    stack.ack_invite(&invite, &retransmission).await
                                {
                                    warn!(error = %error, "failed to ACK 2xx retransmission");
                                }
                            }
                        }
                    });
                } else {
                    tx.finish();
                }
                let _ = final_tx.send(FinalResponse { response, previous }).await;
            }
            LoopOutcome::Challenge(challenge) => {
                let Some(authorizer) = authorizer else {
                    return;
                };
                match authorizer.authorize(&mut request, &challenge) {
                    Ok(()) => {
                        debug!(method = %request.start.method, "retrying with credentials");
                        // The retry carries no authorizer: a second
                        // 401/407 propagates as a plain rejection.
                        let retry = RequestContext {
                            cancel: cancel.clone(),
                            authorizer: None,
                            wait_for_final: true,
                        };
                        match Box::pin(core.request_with_context(request, retry)).await {
                            Ok(Some(response)) => {
                                let _ = final_tx
                                    .send(FinalResponse {
                                        response,
                                        previous: Vec::new(),
                                    })
                                    .await;
                            }
                            Ok(None) => {}
                            Err(error) => {
                                let _ = err_tx.send(error).await;
                            }
                        }
                    }
                    Err(error) => {
                        let _ = err_tx.send(UaError::Auth(error)).await;
                    }
                }
            }
            LoopOutcome::Canceled => {
                tokio::spawn(drain_transaction(tx));
            }
            LoopOutcome::Finished => {}
        }
    }

    /// Consumes the coordinator's internal channels, promoting events
    /// into session transitions and resolving the caller's future.
    ///
    /// The `biased` order guarantees every provisional's callback is
    /// delivered before the final that follows it.
    async fn wait_for_response(
        self: Arc<Self>,
        request: Request,
        cancel: CancellationToken,
        mut prov_rx: mpsc::Receiver<Response>,
        mut final_rx: mpsc::Receiver<FinalResponse>,
        mut err_rx: mpsc::Receiver<UaError>,
    ) -> Result<Response, UaError> {
        let mut provisionals_open = true;
        let mut finals_open = true;
        let mut errors_open = true;

        loop {
            tokio::select! {
                biased;
                provisional = prov_rx.recv(), if provisionals_open => {
                    match provisional {
                        Some(provisional) => self.handle_provisional(&request, &provisional),
                        None => provisionals_open = false,
                    }
                }
                error = err_rx.recv(), if errors_open => {
                    match error {
                        Some(error) => {
                            self.fail_session(&request, &error, cancel.is_cancelled());
                            return Err(error);
                        }
                        None => errors_open = false,
                    }
                }
                final_response = final_rx.recv(), if finals_open => {
                    match final_response {
                        Some(FinalResponse { response, previous }) => {
                            debug!(
                                code = response.code(),
                                provisionals = previous.len(),
                                "final response"
                            );
                            self.confirm_session(&request, &response);
                            return Ok(response);
                        }
                        None => finals_open = false,
                    }
                }
                else => {
                    return Err(UaError::Terminated {
                        response: None,
                        previous: Vec::new(),
                    });
                }
            }
        }
    }

    fn handle_provisional(&self, request: &Request, provisional: &Response) {
        let Some(call_id) = provisional
            .call_id()
            .or_else(|| request.call_id())
            .cloned()
        else {
            return;
        };
        let Some(session) = self.sessions.load(&call_id) else {
            return;
        };

        self.emit(&session, Some(request), Some(provisional), SessionState::Provisional);
        if !provisional.body.is_empty() {
            self.emit(&session, Some(request), Some(provisional), SessionState::EarlyMedia);
        }
    }

    /// Tears the session down on a coordinator error. Cancellation ends
    /// in `Canceled`, everything else in `Failure`; the store entry is
    /// removed before the callback fires.
    fn fail_session(&self, request: &Request, error: &UaError, canceled: bool) {
        let Some(call_id) = request.call_id() else {
            return;
        };
        let Some(session) = self.sessions.remove(call_id) else {
            return;
        };
        let state = if canceled {
            SessionState::Canceled
        } else {
            SessionState::Failure
        };
        self.emit(&session, Some(request), error.response(), state);
    }

    fn confirm_session(&self, request: &Request, response: &Response) {
        signaling_metrics().on_final_response(request.start.method.as_str(), response.code());
        if !request.is_invite() {
            return;
        }
        let Some(call_id) = response.call_id().or_else(|| request.call_id()).cloned() else {
            return;
        };
        let Some(session) = self.sessions.load(&call_id) else {
            return;
        };
        session.complete_dialog(response);
        self.emit(&session, Some(request), Some(response), SessionState::Confirmed);
    }
}

/// Discards remaining transaction events after cancellation so no
/// channel is left blocked; ends when the transaction terminates or
/// both streams close.
async fn drain_transaction(mut tx: ClientTransactionHandle) {
    let done = tx.done.clone();
    let mut responses_open = true;
    let mut errors_open = true;

    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            response = tx.responses.recv(), if responses_open => {
                if response.is_none() {
                    responses_open = false;
                    if !errors_open {
                        return;
                    }
                }
            }
            error = tx.errors.recv(), if errors_open => {
                if error.is_none() {
                    errors_open = false;
                    if !responses_open {
                        return;
                    }
                }
            }
        }
    }
}
