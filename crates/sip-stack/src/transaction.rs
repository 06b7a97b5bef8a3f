// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use sip_core::{Method, Request, Response};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{StackError, TxError};

const RESPONSE_CHANNEL_CAPACITY: usize = 8;
const ERROR_CHANNEL_CAPACITY: usize = 4;
const INBOUND_CHANNEL_CAPACITY: usize = 4;

/// Unique key identifying a transaction (Via branch + method).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
}

impl TransactionKey {
    pub fn new(branch: impl Into<SmolStr>, method: Method) -> Self {
        Self {
            branch: branch.into(),
            method,
        }
    }
}

/// Client transaction as seen by the transaction user.
///
/// The handle owns the receiving ends of the response and error
/// streams; whichever task drains the transaction takes the handle
/// with it. `done()` resolves once the stack considers the
/// transaction terminated, which is also when both streams close.
pub struct ClientTransactionHandle {
    pub key: TransactionKey,
    pub responses: mpsc::Receiver<Response>,
    pub errors: mpsc::Receiver<TxError>,
    /// Cancelled by the stack when the transaction terminates. A public
    /// field so callers can select on it alongside the receivers.
    pub done: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl ClientTransactionHandle {
    /// Creates a connected handle/driver pair for one transaction.
    pub fn channel(key: TransactionKey) -> (Self, ClientTransactionDriver) {
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let done = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let handle = Self {
            key: key.clone(),
            responses: response_rx,
            errors: error_rx,
            done: done.clone(),
            finished: finished.clone(),
        };
        let driver = ClientTransactionDriver {
            key,
            responses: response_tx,
            errors: error_tx,
            done,
            finished,
        };
        (handle, driver)
    }

    /// Signals the stack that the transaction user is finished.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// Stack-side counterpart of a [`ClientTransactionHandle`].
///
/// Real stacks feed this from their transaction state machine; the
/// testkit feeds it from test scripts.
pub struct ClientTransactionDriver {
    pub key: TransactionKey,
    responses: mpsc::Sender<Response>,
    errors: mpsc::Sender<TxError>,
    done: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl ClientTransactionDriver {
    /// Delivers a response; returns false if the receiver is gone.
    pub async fn send_response(&self, response: Response) -> bool {
        self.responses.send(response).await.is_ok()
    }

    /// Delivers a transaction error; returns false if the receiver is gone.
    pub async fn send_error(&self, error: TxError) -> bool {
        self.errors.send(error).await.is_ok()
    }

    /// Marks the transaction terminated, resolving `done()` futures.
    pub fn complete(&self) {
        self.done.cancel();
    }

    /// True once the transaction user called `finish()`.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Server transaction as seen by the transaction user.
///
/// Clonable so a session can keep it for a later respond while the
/// dispatcher's watcher tasks own the CANCEL/ACK streams. Each stream
/// can be taken exactly once.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    pub key: TransactionKey,
    responder: mpsc::Sender<Response>,
    cancels: Arc<Mutex<Option<mpsc::Receiver<Request>>>>,
    acks: Arc<Mutex<Option<mpsc::Receiver<Request>>>>,
}

impl ServerTransactionHandle {
    /// Creates a connected handle/driver pair for one transaction.
    pub fn channel(key: TransactionKey) -> (Self, ServerTransactionDriver) {
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let handle = Self {
            key: key.clone(),
            responder: response_tx,
            cancels: Arc::new(Mutex::new(Some(cancel_rx))),
            acks: Arc::new(Mutex::new(Some(ack_rx))),
        };
        let driver = ServerTransactionDriver {
            key,
            responses: response_rx,
            cancels: cancel_tx,
            acks: ack_tx,
        };
        (handle, driver)
    }

    /// Sends a response through the server transaction.
    pub async fn respond(&self, response: Response) -> Result<(), StackError> {
        self.responder
            .send(response)
            .await
            .map_err(|_| StackError::Closed)
    }

    /// Takes the CANCEL stream; `None` if already taken.
    pub fn take_cancels(&self) -> Option<mpsc::Receiver<Request>> {
        self.cancels.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Takes the ACK stream; `None` if already taken.
    pub fn take_acks(&self) -> Option<mpsc::Receiver<Request>> {
        self.acks.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Stack-side counterpart of a [`ServerTransactionHandle`].
pub struct ServerTransactionDriver {
    pub key: TransactionKey,
    pub responses: mpsc::Receiver<Response>,
    cancels: mpsc::Sender<Request>,
    acks: mpsc::Sender<Request>,
}

impl ServerTransactionDriver {
    /// Delivers a CANCEL for the pending request.
    pub async fn send_cancel(&self, request: Request) -> bool {
        self.cancels.send(request).await.is_ok()
    }

    /// Delivers an ACK for the transaction's final response.
    pub async fn send_ack(&self, request: Request) -> bool {
        self.acks.send(request).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, RequestLine, SipUri, StatusLine};

    fn key() -> TransactionKey {
        TransactionKey::new("z9hG4bKtest", Method::Invite)
    }

    fn response(code: u16) -> Response {
        Response::new(StatusLine::new(code, "OK"), Headers::new(), Bytes::new())
    }

    fn request() -> Request {
        Request::new(
            RequestLine::new(Method::Cancel, SipUri::parse("sip:bob@example.com").unwrap()),
            Headers::new(),
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn client_streams_deliver_in_order() {
        let (mut handle, driver) = ClientTransactionHandle::channel(key());
        assert!(driver.send_response(response(180)).await);
        assert!(driver.send_response(response(200)).await);

        assert_eq!(handle.responses.recv().await.unwrap().code(), 180);
        assert_eq!(handle.responses.recv().await.unwrap().code(), 200);
    }

    #[tokio::test]
    async fn client_done_resolves_on_complete() {
        let (handle, driver) = ClientTransactionHandle::channel(key());
        driver.complete();
        handle.done.cancelled().await;
    }

    #[tokio::test]
    async fn finish_is_visible_to_driver() {
        let (handle, driver) = ClientTransactionHandle::channel(key());
        assert!(!driver.is_finished());
        handle.finish();
        assert!(driver.is_finished());
    }

    #[tokio::test]
    async fn dropping_handle_closes_streams() {
        let (handle, driver) = ClientTransactionHandle::channel(key());
        drop(handle);
        assert!(!driver.send_response(response(200)).await);
        assert!(!driver.send_error(TxError::Timeout).await);
    }

    #[tokio::test]
    async fn server_respond_reaches_driver() {
        let (handle, mut driver) = ServerTransactionHandle::channel(key());
        handle.respond(response(200)).await.unwrap();
        assert_eq!(driver.responses.recv().await.unwrap().code(), 200);
    }

    #[tokio::test]
    async fn server_streams_take_once() {
        let (handle, driver) = ServerTransactionHandle::channel(key());
        let mut cancels = handle.take_cancels().expect("first take");
        assert!(handle.take_cancels().is_none());

        assert!(driver.send_cancel(request()).await);
        assert!(cancels.recv().await.is_some());
    }

    #[tokio::test]
    async fn respond_after_driver_dropped_fails() {
        let (handle, driver) = ServerTransactionHandle::channel(key());
        drop(driver);
        assert!(matches!(
            handle.respond(response(200)).await,
            Err(StackError::Closed)
        ));
    }
}
