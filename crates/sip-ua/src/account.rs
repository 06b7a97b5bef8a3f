// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use sip_auth::{Authorizer, ClientAuthorizer};
use sip_core::Response;
use smol_str::SmolStr;
use uuid::Uuid;

/// Digest credentials attached to a profile.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub auth_name: SmolStr,
    pub password: SmolStr,
}

/// Identity used when originating requests.
///
/// The instance id is stable for the lifetime of the profile and is
/// echoed in Contact as `+sip.instance` so registrars can correlate
/// bindings across re-registrations (RFC 5626 §4.1).
#[derive(Debug, Clone)]
pub struct Profile {
    pub user: SmolStr,
    pub display_name: Option<SmolStr>,
    pub instance_id: Uuid,
    pub auth: Option<AuthInfo>,
}

impl Profile {
    pub fn new(user: &str) -> Self {
        Self {
            user: SmolStr::new(user.to_owned()),
            display_name: None,
            instance_id: Uuid::new_v4(),
            auth: None,
        }
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(SmolStr::new(name.to_owned()));
        self
    }

    pub fn with_auth(mut self, auth_name: &str, password: &str) -> Self {
        self.auth = Some(AuthInfo {
            auth_name: SmolStr::new(auth_name.to_owned()),
            password: SmolStr::new(password.to_owned()),
        });
        self
    }

    /// Builds a fresh authorizer from the profile's credentials.
    pub fn authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        self.auth
            .as_ref()
            .map(|auth| Arc::new(ClientAuthorizer::new(&auth.auth_name, &auth.password)) as _)
    }

    /// Contact parameter value carrying the instance id.
    pub fn instance_param(&self) -> String {
        format!("\"<urn:uuid:{}>\"", self.instance_id)
    }
}

/// Outcome of one registration attempt.
#[derive(Debug, Clone)]
pub struct RegisterState {
    pub profile: Profile,
    pub response: Option<Response>,
    pub status_code: u16,
    pub reason: SmolStr,
    /// Effective expiration in seconds; the server-assigned Expires
    /// wins over the requested value, 0 on failure.
    pub expiration: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_builders_compose() {
        let profile = Profile::new("alice")
            .with_display_name("Alice")
            .with_auth("alice", "secret");
        assert_eq!(profile.user.as_str(), "alice");
        assert_eq!(profile.display_name.as_deref(), Some("Alice"));
        assert!(profile.auth.is_some());
        assert!(profile.authorizer().is_some());
    }

    #[test]
    fn authorizer_absent_without_credentials() {
        assert!(Profile::new("bob").authorizer().is_none());
    }

    #[test]
    fn instance_param_is_urn_formatted() {
        let profile = Profile::new("alice");
        let param = profile.instance_param();
        assert!(param.starts_with("\"<urn:uuid:"));
        assert!(param.ends_with(">\""));
    }
}
