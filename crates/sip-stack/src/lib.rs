// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction-stack boundary consumed by the user-agent core.
//!
//! The user agent does not own transports or RFC 3261 transaction
//! timers; it drives a [`SipStack`] implementation through this
//! interface. Outbound requests yield a [`ClientTransactionHandle`]
//! whose response/error streams the request coordinator drains;
//! inbound requests are delivered to registered [`InboundHandler`]s
//! together with a [`ServerTransactionHandle`] for responding and for
//! watching CANCEL/ACK arrivals on the same transaction.

pub mod transaction;

use std::sync::Arc;

use async_trait::async_trait;
use sip_core::{Method, Request, Response};
use smol_str::SmolStr;
use thiserror::Error;

pub use transaction::{
    ClientTransactionDriver, ClientTransactionHandle, ServerTransactionDriver,
    ServerTransactionHandle, TransactionKey,
};

/// Outbound interface address selected by the stack for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub host: SmolStr,
    pub port: u16,
}

/// Errors surfaced by a transaction's event stream.
///
/// `Timeout` corresponds to RFC 3261 timers B/F/H firing; everything
/// else is a transport-level failure.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("transaction timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Errors returned by [`SipStack`] operations.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack refused request: {0}")]
    Transport(String),
    #[error("transaction closed")]
    Closed,
}

/// Callback invoked for each inbound request of a registered method.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request, transaction: ServerTransactionHandle);
}

/// Contract of the underlying SIP transaction stack.
///
/// Implementations own parsing, transports, Via branch generation, and
/// retransmission timers. The user agent only sequences requests and
/// responses through this trait.
#[async_trait]
pub trait SipStack: Send + Sync + 'static {
    /// Registers the handler invoked for inbound requests of `method`.
    fn on_request(&self, method: Method, handler: Arc<dyn InboundHandler>);

    /// Submits an outbound request, returning its client transaction.
    async fn request(&self, request: Request) -> Result<ClientTransactionHandle, StackError>;

    /// Sends CANCEL for a pending request per RFC 3261 §9.1.
    async fn cancel_request(
        &self,
        request: &Request,
        last_response: &Response,
    ) -> Result<(), StackError>;

    /// Sends ACK for a 2xx response to the given INVITE.
    async fn ack_invite(&self, request: &Request, response: &Response) -> Result<(), StackError>;

    /// Asks the stack to remember an INVITE so retransmitted 2xx
    /// responses can be re-ACKed after the transaction ends.
    async fn remember_invite(&self, request: &Request);

    /// Returns the outbound address for the given transport token.
    fn network_info(&self, transport: &str) -> NetworkInfo;

    /// Gracefully shuts the stack down.
    async fn shutdown(&self);
}
