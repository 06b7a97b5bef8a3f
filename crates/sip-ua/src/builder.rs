// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outbound request construction.
//!
//! Builds well-formed requests (Via, From, To, Contact, Call-ID, CSeq,
//! User-Agent) from a target URI and an account profile. Via and
//! Contact host selection follows the stack's network info for the
//! target's transport, with loopback targets pinned to 127.0.0.1.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sip_core::{Headers, Method, Request, RequestLine, SipUri};
use smol_str::SmolStr;

use crate::{account::Profile, coordinator::Coordinator, error::BuildError};

/// From tags are 8 random alphanumerics.
const FROM_TAG_LEN: usize = 8;

/// A display-name + URI pair with header parameters, as rendered into
/// From, To, and Contact header values.
#[derive(Debug, Clone)]
pub struct Address {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl Address {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: Option<SmolStr>) -> Self {
        self.params.insert(SmolStr::new(name.to_owned()), value);
        self
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

fn random_token(len: usize) -> SmolStr {
    let token: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    SmolStr::new(token)
}

/// Generates a From/To tag.
pub fn random_tag() -> SmolStr {
    random_token(FROM_TAG_LEN)
}

/// Generates an RFC 3261 magic-cookie branch parameter.
pub(crate) fn random_branch() -> SmolStr {
    SmolStr::new(format!("z9hG4bK{}", random_token(16)))
}

fn random_call_id(host: &str) -> SmolStr {
    SmolStr::new(format!("{}@{}", random_token(20), host))
}

/// Builds the From address: the profile's user at the target's host,
/// with a fresh tag.
pub fn from_address(target: &SipUri, profile: &Profile) -> Address {
    let mut uri = SipUri::new(target.host.clone());
    uri.user = Some(profile.user.clone());

    let mut address = Address::new(uri).with_param("tag", Some(random_tag()));
    address.display_name = profile.display_name.clone();
    address
}

/// Builds the To address mirroring the target's user and host.
pub fn to_address(target: &SipUri) -> Address {
    let mut uri = SipUri::new(target.host.clone());
    uri.sips = target.sips;
    uri.user = target.user.clone();
    Address::new(uri)
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl Coordinator {
    /// Renders the Via hop for a request toward `target`.
    ///
    /// Transport comes from the target's `transport` URI parameter
    /// (default udp), the host/port from the stack's network info.
    /// Loopback targets force the Via host to 127.0.0.1, and an
    /// explicit target port overrides network-info's port.
    pub(crate) fn via_hop(&self, target: &SipUri) -> SmolStr {
        let transport = target.transport_param();
        let info = self.stack.network_info(&transport);

        let host = if target.is_loopback() {
            SmolStr::new("127.0.0.1")
        } else {
            info.host.clone()
        };
        let port = target.port.unwrap_or(info.port);

        SmolStr::new(format!(
            "SIP/2.0/{} {};branch={}",
            transport.to_ascii_uppercase(),
            host_port(&host, port),
            random_branch()
        ))
    }

    /// Builds the Contact address advertised for `target`.
    ///
    /// Starts from the sentinel host 0.0.0.0 inheriting the target's
    /// URI parameters, then substitutes the selected network host and
    /// fills in network-info's port when the URI carries none.
    pub(crate) fn contact_address(
        &self,
        target: &SipUri,
        instance_param: Option<String>,
    ) -> Address {
        let transport = target.transport_param();
        let info = self.stack.network_info(&transport);

        let mut uri = SipUri::new("0.0.0.0");
        uri.sips = target.sips;
        uri.params = target.params.clone();

        let host = if target.is_loopback() {
            SmolStr::new("127.0.0.1")
        } else {
            info.host.clone()
        };
        if uri.host == "0.0.0.0" {
            uri.host = host;
        }
        if uri.port.is_none() {
            uri.port = Some(info.port);
        }

        let mut address = Address::new(uri);
        if let Some(instance) = instance_param {
            address = address.with_param("+sip.instance", Some(SmolStr::new(instance)));
        }
        address
    }

    /// Constructs a complete request toward `target`.
    ///
    /// A fresh Call-ID is generated unless one is supplied (in-dialog
    /// requests are built by the session instead, with its Call-ID and
    /// CSeq).
    pub(crate) fn build_request(
        &self,
        method: Method,
        from: &Address,
        to: &Address,
        contact: &Address,
        target: &SipUri,
        call_id: Option<SmolStr>,
    ) -> Result<Request, BuildError> {
        let call_id = call_id.unwrap_or_else(|| {
            let info = self.stack.network_info(&target.transport_param());
            random_call_id(&info.host)
        });

        let mut headers = Headers::new();
        headers.push("Via", self.via_hop(target));
        headers.push("Max-Forwards", "70");
        headers.push("From", from.to_string());
        headers.push("To", to.to_string());
        headers.push("Call-ID", call_id);
        headers.push("CSeq", format!("1 {}", method.as_str()));
        headers.push("Contact", contact.to_string());
        headers.push("User-Agent", self.config.user_agent.clone());
        headers.push("Content-Length", "0");

        Ok(Request::new(
            RequestLine::new(method, target.clone()),
            headers,
            Bytes::new(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::UserAgentConfig;
    use sip_core::{from_tag, tag_param};
    use sip_testkit::MockStack;
    use std::sync::Arc;

    fn coordinator() -> Arc<Coordinator> {
        let stack = Arc::new(MockStack::new("198.51.100.7", 5060));
        Coordinator::new(UserAgentConfig::default(), stack)
    }

    fn target(uri: &str) -> SipUri {
        SipUri::parse(uri).unwrap()
    }

    #[test]
    fn from_address_carries_random_tag() {
        let profile = Profile::new("alice").with_display_name("Alice");
        let address = from_address(&target("sip:bob@example.com"), &profile);
        let rendered = address.to_string();

        assert!(rendered.starts_with("\"Alice\" <sip:alice@example.com>"));
        let tag = tag_param(&rendered).expect("tag present");
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn to_address_mirrors_target() {
        let address = to_address(&target("sips:bob@example.com:5061;transport=tcp"));
        // To drops the port and params, keeps user/host/scheme.
        assert_eq!(address.to_string(), "<sips:bob@example.com>");
    }

    #[test]
    fn via_uses_network_info_host_and_port() {
        let core = coordinator();
        let via = core.via_hop(&target("sip:bob@example.com"));
        assert!(via.starts_with("SIP/2.0/UDP 198.51.100.7:5060;branch=z9hG4bK"));
    }

    #[test]
    fn via_transport_from_uri_param() {
        let core = coordinator();
        let via = core.via_hop(&target("sip:bob@example.com;transport=tcp"));
        assert!(via.starts_with("SIP/2.0/TCP "));
    }

    #[test]
    fn via_forces_loopback_host() {
        let core = coordinator();
        let via = core.via_hop(&target("sip:bob@127.0.0.1"));
        assert!(via.contains(" 127.0.0.1:5060;"));
    }

    #[test]
    fn via_target_port_overrides_network_info() {
        let core = coordinator();
        let via = core.via_hop(&target("sip:bob@example.com:5080"));
        assert!(via.contains(":5080;branch="));
    }

    #[test]
    fn contact_substitutes_sentinel_host() {
        let core = coordinator();
        let address = core.contact_address(&target("sip:bob@example.com;transport=tcp"), None);
        assert_eq!(address.uri.host.as_str(), "198.51.100.7");
        assert_eq!(address.uri.port, Some(5060));
        // Contact inherits the target's URI params.
        assert_eq!(address.uri.transport_param().as_str(), "tcp");
    }

    #[test]
    fn contact_carries_instance_id() {
        let core = coordinator();
        let profile = Profile::new("alice");
        let address = core.contact_address(
            &target("sip:bob@example.com"),
            Some(profile.instance_param()),
        );
        let rendered = address.to_string();
        assert!(rendered.contains("+sip.instance=\"<urn:uuid:"));
    }

    #[test]
    fn build_request_is_complete() {
        let core = coordinator();
        let profile = Profile::new("alice");
        let uri = target("sip:bob@example.com");
        let from = from_address(&uri, &profile);
        let to = to_address(&uri);
        let contact = core.contact_address(&uri, None);

        let request = core
            .build_request(Method::Invite, &from, &to, &contact, &uri, None)
            .unwrap();

        assert!(request.is_invite());
        for name in [
            "Via",
            "Max-Forwards",
            "From",
            "To",
            "Call-ID",
            "CSeq",
            "Contact",
            "User-Agent",
        ] {
            assert!(request.headers.get(name).is_some(), "missing {}", name);
        }
        assert_eq!(request.cseq().map(|(n, _)| n), Some(1));
        assert!(from_tag(&request.headers).is_some());
        assert!(request
            .call_id()
            .map(|v| v.ends_with("@198.51.100.7"))
            .unwrap_or(false));
    }

    #[test]
    fn build_request_honors_supplied_call_id() {
        let core = coordinator();
        let profile = Profile::new("alice");
        let uri = target("sip:bob@example.com");
        let from = from_address(&uri, &profile);
        let to = to_address(&uri);
        let contact = core.contact_address(&uri, None);

        let request = core
            .build_request(
                Method::Invite,
                &from,
                &to,
                &contact,
                &uri,
                Some(SmolStr::new("fixed-call-id")),
            )
            .unwrap();
        assert_eq!(request.call_id().map(|v| v.as_str()), Some("fixed-call-id"));
    }
}
