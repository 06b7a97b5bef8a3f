// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Inbound request dispatch.
//!
//! One handler per method is registered with the stack. Handlers hold
//! the coordinator weakly so the stack's handler table does not keep
//! the user agent alive.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use sip_core::{Method, Request, Response};
use sip_stack::{InboundHandler, ServerTransactionHandle};
use tracing::{debug, warn};

use crate::{
    coordinator::Coordinator,
    session::{InviteSession, SessionState},
};

/// Registers the INVITE/ACK/BYE/CANCEL handlers with the stack.
pub(crate) fn register(core: &Arc<Coordinator>) {
    let stack = core.stack.clone();
    stack.on_request(
        Method::Invite,
        Arc::new(InviteHandler {
            core: Arc::downgrade(core),
        }),
    );
    stack.on_request(
        Method::Ack,
        Arc::new(AckHandler {
            core: Arc::downgrade(core),
        }),
    );
    stack.on_request(
        Method::Bye,
        Arc::new(ByeHandler {
            core: Arc::downgrade(core),
        }),
    );
    stack.on_request(
        Method::Cancel,
        Arc::new(CancelHandler {
            core: Arc::downgrade(core),
        }),
    );
}

struct InviteHandler {
    core: Weak<Coordinator>,
}

#[async_trait]
impl InboundHandler for InviteHandler {
    async fn handle(&self, request: Request, transaction: ServerTransactionHandle) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let Some(call_id) = request.call_id().cloned() else {
            warn!("INVITE without Call-ID dropped");
            return;
        };
        debug!(call_id = %call_id, "inbound INVITE");

        if let Some(session) = core.sessions.load(&call_id) {
            // Same Call-ID mid-dialog: a re-INVITE on the live session.
            session.store_transaction(transaction.clone());
            if !request.body.is_empty() {
                session.set_remote_offer(request.body.clone());
            }
            core.emit(&session, Some(&request), None, SessionState::ReInviteReceived);
        } else {
            let contact = request.headers.get("Contact").cloned();
            let session = InviteSession::new_uas(
                &core,
                call_id.clone(),
                contact,
                request.clone(),
                transaction.clone(),
            );
            core.sessions.insert(call_id.clone(), session.clone());
            core.emit(&session, Some(&request), None, SessionState::InviteReceived);
            core.emit(&session, Some(&request), None, SessionState::WaitingForAnswer);
        }

        // Watch for CANCEL on this INVITE transaction.
        if let Some(mut cancels) = transaction.take_cancels() {
            let core = self.core.clone();
            let invite = request.clone();
            let transaction = transaction.clone();
            tokio::spawn(async move {
                while let Some(cancel) = cancels.recv().await {
                    let Some(core) = core.upgrade() else {
                        return;
                    };
                    debug!(call_id = ?cancel.call_id(), "CANCEL for pending INVITE");

                    let ok = Response::from_request(&cancel, 200, "OK");
                    if transaction.respond(ok.clone()).await.is_err() {
                        warn!("failed to respond 200 to CANCEL");
                    }
                    // The INVITE itself is answered with 487; the stack
                    // does not synthesize it for us.
                    let terminated = Response::from_request(&invite, 487, "Request Terminated");
                    if transaction.respond(terminated).await.is_err() {
                        warn!("failed to respond 487 to canceled INVITE");
                    }

                    if let Some(call_id) = cancel.call_id() {
                        if let Some(session) = core.sessions.remove(call_id) {
                            core.emit(&session, Some(&cancel), Some(&ok), SessionState::Canceled);
                        }
                    }
                }
            });
        }

        // Consume ACK arrivals on the transaction for bookkeeping.
        if let Some(mut acks) = transaction.take_acks() {
            tokio::spawn(async move {
                while let Some(ack) = acks.recv().await {
                    debug!(call_id = ?ack.call_id(), "ACK on INVITE transaction");
                }
            });
        }
    }
}

struct AckHandler {
    core: Weak<Coordinator>,
}

#[async_trait]
impl InboundHandler for AckHandler {
    async fn handle(&self, request: Request, _transaction: ServerTransactionHandle) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let Some(call_id) = request.call_id() else {
            return;
        };
        if let Some(session) = core.sessions.load(call_id) {
            core.emit(&session, Some(&request), None, SessionState::Confirmed);
        }
    }
}

struct ByeHandler {
    core: Weak<Coordinator>,
}

#[async_trait]
impl InboundHandler for ByeHandler {
    async fn handle(&self, request: Request, transaction: ServerTransactionHandle) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        debug!(call_id = ?request.call_id(), "inbound BYE");

        let ok = Response::from_request(&request, 200, "OK");
        if transaction.respond(ok).await.is_err() {
            warn!("failed to respond 200 to BYE");
        }

        if let Some(call_id) = request.call_id() {
            if let Some(session) = core.sessions.remove(call_id) {
                core.emit(&session, Some(&request), None, SessionState::Terminated);
            }
        }
    }
}

struct CancelHandler {
    core: Weak<Coordinator>,
}

#[async_trait]
impl InboundHandler for CancelHandler {
    async fn handle(&self, request: Request, transaction: ServerTransactionHandle) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        debug!(call_id = ?request.call_id(), "inbound CANCEL");

        let ok = Response::from_request(&request, 200, "OK");
        if transaction.respond(ok).await.is_err() {
            warn!("failed to respond 200 to CANCEL");
        }

        if let Some(call_id) = request.call_id() {
            if let Some(session) = core.sessions.remove(call_id) {
                core.emit(&session, Some(&request), None, SessionState::Canceled);
            }
        }
    }
}
