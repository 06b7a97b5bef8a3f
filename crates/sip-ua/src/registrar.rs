// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registrar client: REGISTER with Expires and digest retry.

use sip_core::{expires, Method, SipUri};
use sip_observe::signaling_metrics;
use smol_str::SmolStr;
use tracing::debug;

use crate::{
    account::{Profile, RegisterState},
    builder,
    coordinator::RequestContext,
    error::{BuildError, UaError},
    UserAgent,
};

impl UserAgent {
    /// Registers `profile` with the registrar at `target`.
    ///
    /// Sends REGISTER with the requested Expires, retrying once through
    /// the profile's authorizer on a 401/407 challenge. The
    /// [`RegisterHandler`](crate::RegisterHandler) is invoked exactly
    /// once for every attempt that reached the wire; build and
    /// transport failures return early without invoking it.
    ///
    /// The returned state carries the server-assigned expiration when
    /// the response names one, the requested value otherwise.
    pub async fn send_register(
        &self,
        profile: &Profile,
        target: &str,
        expires_seconds: u32,
    ) -> Result<RegisterState, UaError> {
        let target_uri = SipUri::parse(target)
            .ok_or_else(|| BuildError::InvalidTarget(target.to_owned()))?;

        let from = builder::from_address(&target_uri, profile);
        let to = builder::to_address(&target_uri);
        let contact = self
            .core
            .contact_address(&target_uri, Some(profile.instance_param()));

        let mut request = self.core.build_request(
            Method::Register,
            &from,
            &to,
            &contact,
            &target_uri,
            None,
        )?;
        request
            .headers
            .push("Expires", expires_seconds.to_string());

        let ctx = RequestContext {
            authorizer: profile.authorizer(),
            ..RequestContext::default()
        };

        let state = match self.core.request_with_context(request, ctx).await {
            Ok(Some(response)) => {
                debug!(code = response.code(), "REGISTER answered");
                let expiration = expires(&response.headers).unwrap_or(expires_seconds);
                RegisterState {
                    profile: profile.clone(),
                    status_code: response.code(),
                    reason: SmolStr::new(response.reason().to_owned()),
                    expiration,
                    response: Some(response),
                }
            }
            Ok(None) => RegisterState {
                profile: profile.clone(),
                response: None,
                status_code: 0,
                reason: SmolStr::new("no final response"),
                expiration: 0,
            },
            Err(error @ (UaError::Build(_) | UaError::Transport(_))) => return Err(error),
            Err(error) => {
                debug!(error = %error, "REGISTER failed");
                RegisterState {
                    profile: profile.clone(),
                    response: None,
                    status_code: error.status_code(),
                    reason: error.reason(),
                    expiration: 0,
                }
            }
        };

        signaling_metrics().on_register_outcome(state.status_code);
        if let Some(handler) = self.core.register_handler() {
            handler(&state);
        }
        Ok(state)
    }
}
