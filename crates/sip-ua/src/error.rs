// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

use sip_auth::AuthError;
use sip_core::Response;
use smol_str::SmolStr;
use thiserror::Error;

/// Errors raised while constructing an outbound request.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid target URI: {0}")]
    InvalidTarget(String),
    #[error("request is missing a Call-ID")]
    MissingCallId,
}

/// Error taxonomy of the user-agent core.
///
/// The request coordinator is the only producer of `Timeout`,
/// `Terminated`, and `Rejected`; the inbound dispatcher signals
/// failures through session state transitions instead.
#[derive(Debug, Error)]
pub enum UaError {
    /// Request construction failed; never reaches the wire.
    #[error("request construction failed: {0}")]
    Build(#[from] BuildError),

    /// The stack refused to send.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Transaction timer B/F/H fired (408).
    #[error("408 Request Timeout")]
    Timeout { response: Option<Box<Response>> },

    /// Local cancellation or transaction stream closure (487).
    #[error("487 Request Terminated")]
    Terminated {
        response: Option<Box<Response>>,
        previous: Vec<Response>,
    },

    /// A non-2xx final response, carrying the response and the chain
    /// of prior provisionals for diagnostics.
    #[error("request rejected: {code} {reason}")]
    Rejected {
        code: u16,
        reason: SmolStr,
        response: Box<Response>,
        previous: Vec<Response>,
    },

    /// The authorizer could not answer a 401/407 challenge.
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    /// A session operation was invoked in the wrong role or state.
    #[error("invalid dialog operation: {0}")]
    Dialog(&'static str),
}

impl UaError {
    /// SIP status code equivalent for coordinator-level errors; 0 when
    /// the request never produced one.
    pub fn status_code(&self) -> u16 {
        match self {
            UaError::Timeout { .. } => 408,
            UaError::Terminated { .. } => 487,
            UaError::Rejected { code, .. } => *code,
            _ => 0,
        }
    }

    /// Reason phrase matching [`UaError::status_code`].
    pub fn reason(&self) -> SmolStr {
        match self {
            UaError::Timeout { .. } => SmolStr::new("Request Timeout"),
            UaError::Terminated { .. } => SmolStr::new("Request Terminated"),
            UaError::Rejected { reason, .. } => reason.clone(),
            other => SmolStr::new(other.to_string()),
        }
    }

    /// The last response observed before the error, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            UaError::Timeout { response } | UaError::Terminated { response, .. } => {
                response.as_deref()
            }
            UaError::Rejected { response, .. } => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_variants() {
        let timeout = UaError::Timeout { response: None };
        assert_eq!(timeout.status_code(), 408);
        assert_eq!(timeout.reason().as_str(), "Request Timeout");

        let terminated = UaError::Terminated {
            response: None,
            previous: Vec::new(),
        };
        assert_eq!(terminated.status_code(), 487);

        let build = UaError::Build(BuildError::MissingCallId);
        assert_eq!(build.status_code(), 0);
    }
}
