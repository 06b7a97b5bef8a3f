// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dialog-oriented SIP user agent on top of a transaction stack.
//!
//! [`UserAgent`] turns a [`SipStack`] into a client/server capable of
//! placing calls (UAC), accepting calls (UAS), and registering with a
//! registrar, driving each INVITE dialog through its full state
//! machine: provisionals, early media, digest re-authentication,
//! cancellation, re-INVITE, and termination.
//!
//! Sessions are keyed by Call-ID in a process-wide store. Every state
//! transition invokes the installed [`InviteSessionHandler`]; each
//! registration attempt reports a [`RegisterState`] through the
//! [`RegisterHandler`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use sip_ua::{Profile, UserAgent, UserAgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(stack: Arc<dyn sip_stack::SipStack>) -> Result<(), sip_ua::UaError> {
//! let ua = UserAgent::new(UserAgentConfig::default(), stack);
//! ua.set_invite_handler(Arc::new(|session, _req, _resp, state| {
//!     println!("{} -> {}", session.call_id(), state);
//! }));
//!
//! let alice = Profile::new("alice").with_auth("alice", "secret");
//! ua.send_register(&alice, "sip:registrar.example.com", 3600).await?;
//!
//! let call = ua
//!     .invite(&alice, "sip:bob@example.com", None, CancellationToken::new())
//!     .await?;
//! call.end().await?;
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod builder;
mod coordinator;
mod dispatcher;
pub mod error;
mod registrar;
pub mod session;
pub mod store;

use std::sync::Arc;

use bytes::Bytes;
use sip_core::{Method, Request, Response, SipUri};
use sip_stack::SipStack;
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;

pub use account::{AuthInfo, Profile, RegisterState};
pub use builder::Address;
pub use coordinator::RequestContext;
pub use sip_auth::{Authorizer, ClientAuthorizer};
pub use error::{BuildError, UaError};
pub use session::{Direction, InviteSession, Role, SessionState};
pub use store::SessionStore;

use coordinator::Coordinator;

/// Invoked on every session state transition with the triggering
/// request/response, outside any session lock.
pub type InviteSessionHandler =
    Arc<dyn Fn(&Arc<InviteSession>, Option<&Request>, Option<&Response>, SessionState) + Send + Sync>;

/// Invoked once per registration attempt.
pub type RegisterHandler = Arc<dyn Fn(&RegisterState) + Send + Sync>;

/// User agent configuration.
#[derive(Debug, Clone)]
pub struct UserAgentConfig {
    /// Product token sent in the User-Agent header.
    pub user_agent: SmolStr,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            user_agent: SmolStr::new("warble-rs/0.1.0"),
        }
    }
}

/// The SIP user agent.
///
/// Construction registers the INVITE/ACK/BYE/CANCEL handlers with the
/// stack; dropping the agent lets in-flight tasks finish but detaches
/// the handlers (they hold the core weakly).
pub struct UserAgent {
    core: Arc<Coordinator>,
}

impl UserAgent {
    pub fn new(config: UserAgentConfig, stack: Arc<dyn SipStack>) -> Self {
        let core = Coordinator::new(config, stack);
        dispatcher::register(&core);
        Self { core }
    }

    /// Installs the session state-change callback.
    pub fn set_invite_handler(&self, handler: InviteSessionHandler) {
        self.core.set_invite_handler(handler);
    }

    /// Installs the registration outcome callback.
    pub fn set_register_handler(&self, handler: RegisterHandler) {
        self.core.set_register_handler(handler);
    }

    /// The live session store, keyed by Call-ID.
    pub fn sessions(&self) -> &SessionStore {
        &self.core.sessions
    }

    /// Places a call: builds an INVITE toward `target`, dispatches it
    /// without waiting for the final response, and returns the created
    /// session. Progress arrives through the session handler.
    ///
    /// Cancelling `cancel` after a provisional sends CANCEL and ends
    /// the session in `Canceled`.
    pub async fn invite(
        &self,
        profile: &Profile,
        target: &str,
        sdp: Option<Bytes>,
        cancel: CancellationToken,
    ) -> Result<Arc<InviteSession>, UaError> {
        let target_uri =
            SipUri::parse(target).ok_or_else(|| BuildError::InvalidTarget(target.to_owned()))?;

        let from = builder::from_address(&target_uri, profile);
        let to = builder::to_address(&target_uri);
        let contact = self
            .core
            .contact_address(&target_uri, Some(profile.instance_param()));

        let mut request = self.core.build_request(
            Method::Invite,
            &from,
            &to,
            &contact,
            &target_uri,
            None,
        )?;
        if let Some(sdp) = sdp {
            request.set_body("application/sdp", sdp);
        }
        let call_id = request.call_id().cloned().ok_or(BuildError::MissingCallId)?;

        let ctx = RequestContext {
            cancel,
            authorizer: profile.authorizer(),
            wait_for_final: false,
        };
        self.core.request_with_context(request, ctx).await?;

        self.core
            .sessions
            .load(&call_id)
            .ok_or(UaError::Dialog("invite session not found"))
    }

    /// Submits a request and coordinates its transaction; see
    /// [`RequestContext`] for cancellation, authorization, and
    /// fire-and-forget behavior.
    pub async fn request_with_context(
        &self,
        request: Request,
        ctx: RequestContext,
    ) -> Result<Option<Response>, UaError> {
        self.core.request_with_context(request, ctx).await
    }

    /// Builds a complete request toward `target` without sending it.
    pub fn build_request(
        &self,
        method: Method,
        from: &Address,
        to: &Address,
        contact: &Address,
        target: &SipUri,
        call_id: Option<SmolStr>,
    ) -> Result<Request, BuildError> {
        self.core
            .build_request(method, from, to, contact, target, call_id)
    }

    /// Builds the Contact address the agent advertises for `target`.
    pub fn contact_address(&self, target: &SipUri, instance_param: Option<String>) -> Address {
        self.core.contact_address(target, instance_param)
    }

    /// Hands a request to the stack without transaction coordination.
    pub async fn request(&self, request: Request) -> Result<(), UaError> {
        self.core
            .stack
            .request(request)
            .await
            .map(|_| ())
            .map_err(|e| UaError::Transport(e.to_string()))
    }

    /// Shuts the underlying stack down.
    pub async fn shutdown(&self) {
        self.core.stack.shutdown().await;
    }
}
